// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use balance_ledger::{
    BalanceView, Engine, LedgerService, MemoryStore, OperationId, OrderId, Outcome, Request,
    RequestKind, ServiceId, UserId,
};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Balance Ledger - Replay balance operations from a CSV file
///
/// Reads operations from a CSV file and outputs the resulting balances to
/// stdout. Supports income and the order lifecycle (create, finish, cancel).
#[derive(Parser, Debug)]
#[command(name = "balance-ledger")]
#[command(about = "Replays balance operations and prints the resulting balances", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: type,operation,user,service,order,amount
    /// Example: cargo run -- operations.csv > balances.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Maximum time an operation waits for a balance row lock
    #[arg(long, env = "LEDGER_LOCK_TIMEOUT_MS", default_value_t = 5000)]
    lock_timeout_ms: u64,

    /// Retries for operations failing with a transient store error
    #[arg(long, env = "LEDGER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base delay between retries, multiplied by the attempt number
    #[arg(long, env = "LEDGER_RETRY_BACKOFF_MS", default_value_t = 10)]
    retry_backoff_ms: u64,

    /// Also write the journal as CSV to this file
    #[arg(long, value_name = "FILE")]
    journal: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let store = MemoryStore::with_lock_timeout(Duration::from_millis(args.lock_timeout_ms));
    let service = LedgerService::new(Engine::new(store))
        .with_max_retries(args.max_retries)
        .with_retry_backoff(Duration::from_millis(args.retry_backoff_ms));
    info!(
        lock_timeout = ?service.engine().store().lock_timeout(),
        max_retries = args.max_retries,
        input = %args.input.display(),
        "Replaying operations"
    );

    let summary = match process_operations(&service, BufReader::new(file)) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error processing operations: {}", e);
            process::exit(1);
        }
    };
    info!(?summary, "Replay finished");

    if !verify_journal(&service) {
        eprintln!("Error: balances do not match the journal");
        process::exit(1);
    }

    if let Err(e) = write_balances(&service, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }

    if let Some(path) = &args.journal {
        let result = File::create(path)
            .map_err(csv::Error::from)
            .and_then(|file| write_journal(&service, file));
        if let Err(e) = result {
            eprintln!("Error writing journal '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `type, operation, user, service, order, amount`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    op_type: String,
    operation: u64,
    user: u64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    service: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    order: Option<u64>,
    amount: Decimal,
}

impl CsvRecord {
    /// Converts a CSV record into a request.
    ///
    /// Returns `None` for unknown operation types.
    fn into_request(self) -> Option<(RequestKind, Request)> {
        let kind = match self.op_type.to_lowercase().as_str() {
            "income" => RequestKind::Income,
            "create" | "create_order" => RequestKind::CreateOrder,
            "finish" | "finish_order" => RequestKind::FinishOrder,
            "cancel" | "cancel_order" => RequestKind::CancelOrder,
            _ => return None,
        };

        Some((
            kind,
            Request {
                operation_id: OperationId(self.operation),
                user_id: UserId(self.user),
                service_id: self.service.map(ServiceId),
                order_id: self.order.map(OrderId),
                amount: self.amount,
            },
        ))
    }
}

/// Counts of replayed operations by outcome.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub applied: usize,
    pub declined: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Replays operations from a CSV reader through `service`.
///
/// Rows are streamed one at a time. Malformed rows are logged and skipped;
/// every other row is counted in the returned [`Summary`] by its outcome.
///
/// # CSV Format
///
/// Expected columns: `type, operation, user, service, order, amount`
/// - `type`: income, create, finish or cancel
/// - `operation`: operation ID (u64), unique per request
/// - `user`: user ID (u64)
/// - `service`, `order`: order reference (empty for income)
/// - `amount`: decimal amount in major units
///
/// # Example
///
/// ```csv
/// type,operation,user,service,order,amount
/// income,1,1,,,10.00
/// create,2,1,1,100,4.00
/// finish,3,1,1,100,4.00
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn process_operations<R: Read>(
    service: &LedgerService,
    reader: R,
) -> Result<Summary, csv::Error> {
    let mut summary = Summary::default();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (row_idx, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let row = row_idx + 2; // 1-indexed, after the header

        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e),
            Err(e) => {
                warn!(row, error = %e, "Skipping malformed row");
                summary.rejected += 1;
                continue;
            }
        };
        let Some((kind, request)) = record.into_request() else {
            warn!(row, "Skipping row with unknown operation type");
            summary.rejected += 1;
            continue;
        };

        match service.handle(kind, &request) {
            Outcome::Success(_) => summary.applied += 1,
            Outcome::Declined(status) => {
                info!(row, status, "Operation declined");
                summary.declined += 1;
            }
            Outcome::BadRequest(message) | Outcome::NotFound(message) => {
                warn!(row, %message, "Operation rejected");
                summary.rejected += 1;
            }
            Outcome::Fault => summary.failed += 1,
        }
    }

    Ok(summary)
}

/// Checks every balance against its journal. Returns `false` on any mismatch.
fn verify_journal(service: &LedgerService) -> bool {
    let engine = service.engine();
    let mut consistent = true;
    for balance in engine.store().balances() {
        match engine.reconcile(balance.user_id()) {
            Ok(reconciliation) if reconciliation.is_consistent() => {}
            Ok(reconciliation) => {
                error!(?reconciliation, "Journal mismatch");
                consistent = false;
            }
            Err(e) => {
                error!(user_id = %balance.user_id(), error = %e, "Reconciliation failed");
                consistent = false;
            }
        }
    }
    consistent
}

/// Writes all balances as CSV, ordered by user ID.
///
/// # CSV Format
///
/// Columns: `userId, balance, held, spendableMinor, heldMinor`
pub fn write_balances<W: Write>(service: &LedgerService, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for balance in service.engine().store().balances() {
        wtr.serialize(BalanceView::from(&balance))?;
    }

    wtr.flush()?;
    Ok(())
}

/// Writes the journal as CSV, in commit order.
pub fn write_journal<W: Write>(service: &LedgerService, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for entry in service.engine().store().journal_entries() {
        wtr.serialize(entry)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use balance_ledger::{OrderRef, OrderState};
    use std::io::Cursor;

    fn service() -> LedgerService {
        LedgerService::new(Engine::new(MemoryStore::new()))
    }

    #[test]
    fn parse_simple_income() {
        let csv = "type,operation,user,service,order,amount\nincome,1,1,,,10.00\n";
        let service = service();

        let summary = process_operations(&service, Cursor::new(csv)).unwrap();

        assert_eq!(summary.applied, 1);
        let balance = service.engine().balance(UserId(1)).unwrap();
        assert_eq!(balance.spendable(), 1000);
    }

    #[test]
    fn parse_order_lifecycle() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,1,,,10.00\n\
                   create,2,1,1,100,4.00\n\
                   finish,3,1,1,100,4.00\n";
        let service = service();

        let summary = process_operations(&service, Cursor::new(csv)).unwrap();

        assert_eq!(summary.applied, 3);
        let balance = service.engine().balance(UserId(1)).unwrap();
        assert_eq!(balance.spendable(), 600);
        assert_eq!(balance.held(), 0);
        let order = OrderRef::new(ServiceId(1), OrderId(100));
        assert_eq!(
            service.engine().order_state(UserId(1), order).unwrap(),
            OrderState::Captured
        );
    }

    #[test]
    fn declined_and_rejected_rows_are_counted() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,1,,,5.00\n\
                   create,2,1,1,100,6.00\n\
                   create,3,2,1,101,1.00\n\
                   income,4,1,,,0\n";
        let service = service();

        let summary = process_operations(&service, Cursor::new(csv)).unwrap();

        assert_eq!(
            summary,
            Summary {
                applied: 1,
                declined: 1,
                rejected: 2,
                failed: 0,
            }
        );
    }

    #[test]
    fn parse_with_whitespace() {
        let csv = "type,operation,user,service,order,amount\n income , 1 , 1 , , , 2.50 \n";
        let service = service();

        process_operations(&service, Cursor::new(csv)).unwrap();

        let balance = service.engine().balance(UserId(1)).unwrap();
        assert_eq!(balance.spendable(), 250);
    }

    #[test]
    fn skip_malformed_rows() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,1,,,10.0\n\
                   invalid,row,data,here,x,y\n\
                   transfer,2,2,,,1.0\n\
                   income,3,2,,,5.0\n";
        let service = service();

        let summary = process_operations(&service, Cursor::new(csv)).unwrap();

        assert_eq!(summary.applied, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(service.engine().store().balances().len(), 2);
    }

    #[test]
    fn replayed_operation_is_applied_once() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,1,,,10.00\n\
                   income,1,1,,,10.00\n";
        let service = service();

        let summary = process_operations(&service, Cursor::new(csv)).unwrap();

        assert_eq!(summary.applied, 2);
        assert_eq!(service.engine().balance(UserId(1)).unwrap().spendable(), 1000);
        assert_eq!(service.engine().store().journal_entries().len(), 1);
    }

    #[test]
    fn write_balances_to_csv() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,2,,,3.00\n\
                   income,2,1,,,10.00\n";
        let service = service();
        process_operations(&service, Cursor::new(csv)).unwrap();

        let mut output = Vec::new();
        write_balances(&service, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let mut lines = output.lines();
        assert_eq!(
            lines.next(),
            Some("userId,balance,held,spendableMinor,heldMinor")
        );
        assert!(lines.next().unwrap().starts_with("1,10,"));
        assert!(lines.next().unwrap().starts_with("2,3,"));
    }

    #[test]
    fn write_journal_to_csv() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,1,,,10.00\n\
                   create,2,1,7,100,4.00\n";
        let service = service();
        process_operations(&service, Cursor::new(csv)).unwrap();

        let mut output = Vec::new();
        write_journal(&service, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with(
            "sequence,operation_id,user_id,kind,service_id,order_id,amount,created_at"
        ));
        assert!(output.contains("1,1,1,transfer,,,1000,"));
        assert!(output.contains("2,2,1,capture,7,100,-400,"));
    }

    #[test]
    fn journal_matches_balances_after_replay() {
        let csv = "type,operation,user,service,order,amount\n\
                   income,1,1,,,10.00\n\
                   create,2,1,1,1,4.00\n\
                   cancel,3,1,1,1,1.00\n";
        let service = service();
        process_operations(&service, Cursor::new(csv)).unwrap();

        assert!(verify_journal(&service));
    }
}
