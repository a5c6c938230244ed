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

use bank_ledger_rs::{
    AccountId, Currency, Engine, LedgerConfig, NewAccount, Page, Store, StoreError,
    TransferRequest,
};
use clap::Parser;
use crossbeam::channel;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Bank Ledger - Run money transfers between accounts from CSV files
///
/// Opens the accounts listed in ACCOUNTS, runs the transfers in TRANSFERS on
/// a pool of worker threads and writes the final account states to stdout.
#[derive(Parser, Debug)]
#[command(name = "bank-ledger")]
#[command(about = "A double-entry ledger that runs transfer CSVs", long_about = None)]
struct Args {
    /// SQLite database file; the ledger is kept in memory when omitted
    #[arg(long, env = "LEDGER_DATABASE", value_name = "PATH")]
    database: Option<PathBuf>,

    /// Number of worker threads running transfers
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,

    /// Longest wait for an account row lock, in milliseconds
    #[arg(long, env = "LEDGER_LOCK_TIMEOUT_MS", default_value_t = 5_000)]
    lock_timeout_ms: u64,

    /// Retries after a transient storage failure
    #[arg(long, env = "LEDGER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Check every account balance against its entries after the run
    #[arg(long)]
    reconcile: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// CSV file with accounts to open
    ///
    /// Expected format: owner,currency,balance
    #[arg(value_name = "ACCOUNTS")]
    accounts: PathBuf,

    /// CSV file with transfers to run
    ///
    /// Expected format: from,to,amount[,currency]
    /// Example: bank-ledger accounts.csv transfers.csv > balances.csv
    #[arg(value_name = "TRANSFERS")]
    transfers: PathBuf,
}

impl Args {
    fn config(&self) -> LedgerConfig {
        LedgerConfig {
            database: self.database.clone(),
            lock_timeout_ms: self.lock_timeout_ms,
            max_retries: self.max_retries,
            ..LedgerConfig::default()
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot open '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} account(s) do not match their entries")]
    Unreconciled(usize),
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = args.config();
    let result = match &config.database {
        Some(path) => Engine::sqlite(path, config.clone())
            .map_err(CliError::from)
            .and_then(|engine| run(&engine, &args)),
        None => run(&Engine::in_memory(config.clone()), &args),
    };

    if let Err(e) = result {
        error!(error = %e, "Run failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn open_file(path: &Path) -> Result<BufReader<File>, CliError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CliError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn run<S: Store>(engine: &Engine<S>, args: &Args) -> Result<(), CliError> {
    let opened = open_accounts(engine, open_file(&args.accounts)?)?;
    info!(opened, "Accounts opened");

    let summary = process_transfers(engine, open_file(&args.transfers)?, usize::from(args.workers))?;
    info!(
        applied = summary.applied,
        rejected = summary.rejected,
        "Transfers processed"
    );

    if args.reconcile {
        reconcile(engine)?;
    }

    write_accounts(engine, std::io::stdout())
}

/// Raw CSV record of the accounts file.
///
/// Fields: `owner, currency, balance`
#[derive(Debug, Deserialize)]
struct AccountRecord {
    owner: String,
    currency: String,
    balance: Decimal,
}

impl AccountRecord {
    fn into_new_account(self) -> Result<NewAccount, String> {
        let currency = self.currency.parse::<Currency>().map_err(|e| e.to_string())?;
        let balance = currency
            .to_minor(self.balance)
            .ok_or_else(|| format!("invalid {} amount {}", currency, self.balance))?;
        Ok(NewAccount::new(self.owner, currency).with_opening_balance(balance))
    }
}

/// Raw CSV record of the transfers file.
///
/// Fields: `from, to, amount, currency` (currency optional)
#[derive(Debug, Deserialize)]
struct TransferRecord {
    from: i64,
    to: i64,
    amount: Decimal,
    #[serde(default)]
    currency: Option<String>,
}

impl TransferRecord {
    /// Converts the record into a request in minor units.
    ///
    /// Without an explicit currency the amount is read in the source
    /// account's currency.
    fn into_request<S: Store>(self, engine: &Engine<S>) -> Result<TransferRequest, String> {
        let from = AccountId(self.from);
        let to = AccountId(self.to);
        let requested = match self.currency.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(code) => Some(code.parse::<Currency>().map_err(|e| e.to_string())?),
        };
        let currency = match requested {
            Some(currency) => currency,
            None => engine.get_account(from).map_err(|e| e.to_string())?.currency,
        };
        let amount = currency
            .to_minor(self.amount)
            .ok_or_else(|| format!("invalid {} amount {}", currency, self.amount))?;

        let request = TransferRequest::new(from, to, amount);
        Ok(match requested {
            Some(currency) => request.in_currency(currency),
            None => request,
        })
    }
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All) // Handle whitespace in fields like " USD "
        .flexible(true) // Allow missing currency field
        .has_headers(true) // Skip first row as header
        .from_reader(reader)
}

/// Opens every account in an accounts CSV, in file order.
///
/// Malformed rows and accounts the store refuses are skipped and logged.
///
/// # Errors
///
/// Returns an error if reading the file fails, or the store fails for any
/// reason other than a rejected account.
fn open_accounts<S: Store, R: Read>(engine: &Engine<S>, reader: R) -> Result<usize, CliError> {
    let mut opened = 0;

    for (line, result) in csv_reader(reader).deserialize::<AccountRecord>().enumerate() {
        let line = line + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                warn!(line, error = %e, "Skipping malformed account row");
                continue;
            }
        };
        let account = match record.into_new_account() {
            Ok(account) => account,
            Err(reason) => {
                warn!(line, %reason, "Skipping account row");
                continue;
            }
        };

        match engine.open_account(account) {
            Ok(_) => opened += 1,
            Err(StoreError::Constraint(reason)) => {
                warn!(line, %reason, "Skipping account row");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(opened)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TransferSummary {
    applied: usize,
    rejected: usize,
}

/// Runs every transfer in a transfers CSV on `workers` threads.
///
/// Rows are parsed on the calling thread and handed to the workers over a
/// bounded channel, so the file is streamed rather than loaded whole.
/// Malformed rows and rejected transfers are logged and counted, and never
/// stop the run.
///
/// # Errors
///
/// Returns an error if reading the file fails; transfers already handed to
/// the workers still run to completion first.
fn process_transfers<S: Store, R: Read>(
    engine: &Engine<S>,
    reader: R,
    workers: usize,
) -> Result<TransferSummary, CliError> {
    let (sender, receiver) = channel::bounded::<TransferRequest>(workers * 64);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                scope.spawn(move || {
                    let mut summary = TransferSummary::default();
                    for request in receiver {
                        match engine.transfer(request) {
                            Ok(result) => {
                                debug!(transfer_id = %result.transfer.id, "Transfer applied");
                                summary.applied += 1;
                            }
                            Err(e) => {
                                warn!(
                                    from = %request.from_account_id,
                                    to = %request.to_account_id,
                                    amount = request.amount,
                                    error = %e,
                                    "Transfer rejected"
                                );
                                summary.rejected += 1;
                            }
                        }
                    }
                    summary
                })
            })
            .collect();
        drop(receiver);

        let mut summary = TransferSummary::default();
        let mut failure = None;
        let mut reader = csv_reader(reader);
        for (line, result) in reader.deserialize::<TransferRecord>().enumerate() {
            let line = line + 2;
            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_io_error() => {
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(line, error = %e, "Skipping malformed transfer row");
                    summary.rejected += 1;
                    continue;
                }
            };
            match record.into_request(engine) {
                Ok(request) => {
                    if sender.send(request).is_err() {
                        break;
                    }
                }
                Err(reason) => {
                    warn!(line, %reason, "Skipping transfer row");
                    summary.rejected += 1;
                }
            }
        }
        drop(sender);

        for handle in handles {
            let worker = handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            summary.applied += worker.applied;
            summary.rejected += worker.rejected;
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    })
}

/// Reconciles every account, failing if any balance disagrees with its
/// entries.
fn reconcile<S: Store>(engine: &Engine<S>) -> Result<(), CliError> {
    let reconciliations = engine.entry_ledger().reconcile_all()?;
    let unbalanced = reconciliations
        .iter()
        .filter(|reconciliation| !reconciliation.is_balanced())
        .count();
    info!(
        accounts = reconciliations.len(),
        unbalanced, "Reconciliation finished"
    );
    if unbalanced > 0 {
        return Err(CliError::Unreconciled(unbalanced));
    }
    Ok(())
}

/// Output record with the balance in major units.
#[derive(Debug, Serialize)]
struct BalanceRecord {
    id: AccountId,
    owner: String,
    currency: Currency,
    balance: Decimal,
}

/// Write account states to a CSV writer
///
/// # CSV Format
///
/// Columns: `id, owner, currency, balance`
///
/// # Example
///
/// ```csv
/// id,owner,currency,balance
/// 1,alice,USD,4.95
/// 2,bob,USD,3.05
/// ```
///
/// # Errors
///
/// Returns an error if reading accounts or writing fails.
fn write_accounts<S: Store, W: Write>(engine: &Engine<S>, writer: W) -> Result<(), CliError> {
    let mut wtr = Writer::from_writer(writer);

    let mut page = Page::new(0, 100);
    loop {
        let accounts = engine.store().list_accounts(page)?;
        if accounts.is_empty() {
            break;
        }
        for account in accounts {
            wtr.serialize(BalanceRecord {
                id: account.id,
                owner: account.owner.clone(),
                currency: account.currency,
                balance: account.balance_major(),
            })?;
        }
        page = page.next();
    }

    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bank_ledger_rs::MemoryStore;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    fn engine_with_accounts(csv: &str) -> Engine<MemoryStore> {
        let engine = Engine::default();
        open_accounts(&engine, Cursor::new(csv)).unwrap();
        engine
    }

    fn balance(engine: &Engine<MemoryStore>, id: i64) -> Decimal {
        engine.get_account(AccountId(id)).unwrap().balance_major()
    }

    #[test]
    fn parse_accounts() {
        let engine = engine_with_accounts("owner,currency,balance\nalice,USD,5.00\nbob,eur,3\n");

        assert_eq!(balance(&engine, 1), dec!(5.00));
        assert_eq!(balance(&engine, 2), dec!(3));
        assert_eq!(engine.get_account(AccountId(2)).unwrap().currency, Currency::Eur);
    }

    #[test]
    fn skip_malformed_account_rows() {
        let csv = "owner,currency,balance\n\
                   alice,USD,5.00\n\
                   bob,GBP,1.00\n\
                   carol,USD,0.001\n\
                   ,USD,1.00\n\
                   dave,USD,-1.00\n\
                   erin,USD,2.50\n";
        let engine = Engine::default();

        let opened = open_accounts(&engine, Cursor::new(csv)).unwrap();

        assert_eq!(opened, 2);
        assert_eq!(balance(&engine, 2), dec!(2.50));
    }

    #[test]
    fn parse_transfers_with_whitespace() {
        let engine = engine_with_accounts("owner,currency,balance\nalice,USD,5.00\nbob,USD,3.00\n");
        let csv = "from,to,amount,currency\n 1 , 2 , 0.05 , usd \n";

        let summary = process_transfers(&engine, Cursor::new(csv), 2).unwrap();

        assert_eq!(summary, TransferSummary { applied: 1, rejected: 0 });
        assert_eq!(balance(&engine, 1), dec!(4.95));
        assert_eq!(balance(&engine, 2), dec!(3.05));
    }

    #[test]
    fn currency_column_is_optional() {
        let engine = engine_with_accounts("owner,currency,balance\nalice,SAR,5.00\nbob,SAR,0\n");
        let csv = "from,to,amount\n1,2,1.25\n";

        let summary = process_transfers(&engine, Cursor::new(csv), 1).unwrap();

        assert_eq!(summary.applied, 1);
        assert_eq!(balance(&engine, 2), dec!(1.25));
    }

    #[test]
    fn rejected_transfers_do_not_stop_the_run() {
        let engine = engine_with_accounts(
            "owner,currency,balance\nalice,USD,5.00\nbob,USD,0\ncarol,EUR,1.00\n",
        );
        let csv = "from,to,amount,currency\n\
                   1,2,10.00,\n\
                   1,9,1.00,\n\
                   1,3,1.00,\n\
                   1,2,1.00,EUR\n\
                   not,a,row,\n\
                   1,2,-1,\n\
                   1,2,4.00,\n";

        let summary = process_transfers(&engine, Cursor::new(csv), 4).unwrap();

        assert_eq!(summary, TransferSummary { applied: 1, rejected: 6 });
        assert_eq!(balance(&engine, 1), dec!(1.00));
        assert_eq!(balance(&engine, 2), dec!(4.00));
        assert_eq!(balance(&engine, 3), dec!(1.00));
    }

    #[test]
    fn many_workers_conserve_money() {
        let engine = engine_with_accounts("owner,currency,balance\na,USD,100\nb,USD,100\n");
        let mut csv = String::from("from,to,amount\n");
        for i in 0..200 {
            let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
            csv.push_str(&format!("{from},{to},0.10\n"));
        }

        let summary = process_transfers(&engine, Cursor::new(csv), 8).unwrap();

        assert_eq!(summary.applied, 200);
        assert_eq!(balance(&engine, 1) + balance(&engine, 2), dec!(200));
        reconcile(&engine).unwrap();
    }

    #[test]
    fn write_accounts_to_csv() {
        let engine = engine_with_accounts("owner,currency,balance\nalice,USD,5.00\nbob,LE,3.05\n");
        process_transfers(&engine, Cursor::new("from,to,amount\n1,1,1\n"), 1).unwrap();

        let mut output = Vec::new();
        write_accounts(&engine, &mut output).unwrap();

        let output_str = String::from_utf8(output).unwrap();
        assert_eq!(
            output_str,
            "id,owner,currency,balance\n1,alice,USD,5.00\n2,bob,LE,3.05\n"
        );
    }

    #[test]
    fn write_pages_through_every_account() {
        let mut csv = String::from("owner,currency,balance\n");
        for i in 0..250 {
            csv.push_str(&format!("owner-{i},USD,1\n"));
        }
        let engine = engine_with_accounts(&csv);

        let mut output = Vec::new();
        write_accounts(&engine, &mut output).unwrap();

        let output_str = String::from_utf8(output).unwrap();
        assert_eq!(output_str.lines().count(), 251);
    }
}
