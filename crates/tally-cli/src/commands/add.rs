use chrono::NaiveDate;
use tally_core::models::{
    CategoryOrder, CustomCategory, Debt, EntryDirection, Goal, HiddenCategory, LedgerEntry,
};
use tally_core::util::normalize_text_option;

use crate::cli::{AddCommands, EntryArgs};
use crate::commands::common::{open_ledger, parse_amount_cents, parse_date, CliContext};
use crate::error::CliError;

pub async fn run_add(ctx: &CliContext, record: AddCommands) -> Result<(), CliError> {
    let ledger = open_ledger(ctx).await?;

    let id = match record {
        AddCommands::Entry(args) => {
            let today = chrono::Local::now().date_naive();
            ledger.add(&entry_from_args(args, today)?).await?
        }
        AddCommands::Debt {
            counterparty,
            amount,
            due,
        } => {
            let debt = Debt {
                counterparty: counterparty.trim().to_string(),
                amount_cents: parse_amount_cents(&amount)?,
                due_date: due.as_deref().map(parse_date).transpose()?,
                settled: false,
            };
            ledger.add(&debt).await?
        }
        AddCommands::Goal {
            name,
            target,
            saved,
            by,
        } => {
            let goal = Goal {
                name: name.trim().to_string(),
                target_cents: parse_amount_cents(&target)?,
                saved_cents: saved.as_deref().map(parse_amount_cents).transpose()?.unwrap_or(0),
                target_date: by.as_deref().map(parse_date).transpose()?,
            };
            ledger.add(&goal).await?
        }
        AddCommands::Category { name, icon, color } => {
            let category = CustomCategory {
                name: name.trim().to_string(),
                icon: normalize_text_option(icon),
                color: normalize_text_option(color),
            };
            ledger.add(&category).await?
        }
        AddCommands::Hide { category_id } => {
            ledger
                .add(&HiddenCategory {
                    category_id: category_id.trim().to_string(),
                })
                .await?
        }
        AddCommands::Order {
            category_id,
            position,
        } => {
            ledger
                .add(&CategoryOrder {
                    category_id: category_id.trim().to_string(),
                    position,
                })
                .await?
        }
    };

    println!("{id}");
    Ok(())
}

/// Build an entry; the sign lives in the direction, so amounts must be positive
pub fn entry_from_args(args: EntryArgs, today: NaiveDate) -> Result<LedgerEntry, CliError> {
    let amount_cents = parse_amount_cents(&args.amount)?;
    if amount_cents <= 0 {
        return Err(CliError::InvalidAmount(args.amount));
    }

    Ok(LedgerEntry {
        amount_cents,
        direction: if args.income {
            EntryDirection::Income
        } else {
            EntryDirection::Expense
        },
        occurred_on: args.on.as_deref().map(parse_date).transpose()?.unwrap_or(today),
        category_id: normalize_text_option(args.category),
        note: normalize_text_option(args.note),
    })
}
