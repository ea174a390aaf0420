//! Schema export handler.

use anyhow::Result;

use marketcap_core::RANKINGS_SCHEMA;

use crate::cli::SchemaFormat;

pub fn run_schema_command(format: SchemaFormat) -> Result<()> {
    match format {
        SchemaFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&RANKINGS_SCHEMA.json_schema())?);
        }
        SchemaFormat::Ddl => {
            println!("{};", RANKINGS_SCHEMA.table_ddl());
            for ddl in RANKINGS_SCHEMA.index_ddl() {
                println!("{ddl};");
            }
        }
    }
    Ok(())
}
