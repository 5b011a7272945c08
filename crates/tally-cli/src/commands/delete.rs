use tally_core::EntityKind;

use crate::commands::common::{open_ledger, resolve_record, CliContext};
use crate::error::CliError;

pub async fn run_delete(ctx: &CliContext, kind: EntityKind, id: &str) -> Result<(), CliError> {
    let ledger = open_ledger(ctx).await?;
    let record = resolve_record(&ledger, kind, id).await?;
    ledger.delete_entity(kind, &record.id).await?;
    println!("{}", record.id);
    Ok(())
}
