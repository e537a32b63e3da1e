use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use comfy_pilot::logger::init_tracing;
use comfy_pilot::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory (default: <root>/schemas)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    init_tracing(&context.root, "warn", false)?;
    let out_dir = args.out.unwrap_or_else(|| context.root.join("schemas"));
    let files = write_schema(&out_dir)?;
    for file in files {
        println!("  {file}");
    }
    println!("Schemas written to {}", out_dir.display());
    Ok(())
}
