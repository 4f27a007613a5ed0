//! Command-line front end for semlock sets.
//!
//! Mostly useful from shell scripts and for exercising the protocol across
//! real processes.
//!
//! # Usage
//!
//! ```sh
//! # Hold slot 0 until stdin closes (or the process is killed)
//! semlock hold --path /var/run/myapp --project 1 --slots 4 --slot 0
//!
//! # Non-blocking attempt from another shell
//! semlock try-lock --path /var/run/myapp --project 1 --slots 4 --slot 0
//!
//! # Inspect and clean up
//! semlock stat --path /var/run/myapp --project 1
//! semlock purge --path /var/run/myapp --project 1
//! ```
//!
//! Set `RUST_LOG` and build with `--features tracing` for protocol logs on
//! stderr.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use semlock::ipc::sem::SemSet;
use semlock::{GUARD_CAPACITY, IpcKey, Mode, Semlock, SemlockConfig, SemlockError};

/// Named cross-process slot locks on System V semaphore sets.
#[derive(Parser, Debug)]
#[command(name = "semlock")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach, lock a slot, and hold it until stdin reaches EOF.
    ///
    /// Prints `locked <pid>` once the slot is held.
    Hold(HoldArgs),

    /// Attach and stay attached until stdin reaches EOF.
    ///
    /// Prints `attached <role> <pid>` once the guard share is registered.
    Attach(StayArgs),

    /// Attach and try to lock a slot without waiting.
    ///
    /// Prints `acquired` or `busy`. An acquired slot is released on exit.
    TryLock(SlotArgs),

    /// Attach, then give the share back and destroy the set if last.
    ///
    /// Prints `removed` or `in-use`.
    Remove(SetArgs),

    /// Print the set's key, id, attachment count and slot values.
    ///
    /// Reads the set without attaching to (or creating) it.
    Stat(KeyArgs),

    /// Destroy the set regardless of who is attached.
    Purge(KeyArgs),
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// Existing file or directory the key is derived from.
    #[arg(long)]
    path: PathBuf,

    /// Project tag mixed into the key (low 8 bits, non-zero).
    #[arg(long, default_value_t = 1)]
    project: i32,
}

#[derive(Args, Debug)]
struct SetArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// Number of lock slots.
    #[arg(long, default_value_t = 1)]
    slots: u16,

    /// Octal permission bits used if this process creates the set.
    #[arg(long, default_value = "600", value_parser = parse_mode)]
    mode: Mode,

    /// Milliseconds between polls while waiting for the owner.
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,
}

#[derive(Args, Debug)]
struct SlotArgs {
    #[command(flatten)]
    set: SetArgs,

    /// Slot index, from 0.
    #[arg(long, allow_negative_numbers = true)]
    slot: i32,
}

#[derive(Args, Debug)]
struct HoldArgs {
    #[command(flatten)]
    slot: SlotArgs,

    /// Call remove instead of plain detach after stdin closes.
    #[arg(long)]
    remove: bool,
}

#[derive(Args, Debug)]
struct StayArgs {
    #[command(flatten)]
    set: SetArgs,

    /// Call remove instead of plain detach after stdin closes.
    #[arg(long)]
    remove: bool,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    let bits = u32::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode `{s}`: {e}"))?;
    if bits > 0o777 {
        return Err(format!("mode `{s}` has bits outside 0o777"));
    }
    Ok(Mode::from_bits_truncate(bits))
}

impl SetArgs {
    fn open(&self) -> Result<Semlock, SemlockError> {
        let key = IpcKey::resolve(&self.key.path, self.key.project)?;
        let config = SemlockConfig {
            slots: self.slots,
            mode: self.mode,
            init_poll_interval: Duration::from_millis(self.poll_ms),
        };
        Semlock::attach(key, &config)
    }
}

fn main() -> ExitCode {
    semlock::init_tracing();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("semlock: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), SemlockError> {
    match command {
        Command::Hold(args) => {
            let lock = args.slot.set.open()?;
            lock.lock(args.slot.slot)?;
            say(&format!("locked {}", std::process::id()));

            wait_for_eof();

            lock.unlock(args.slot.slot)?;
            leave(lock, args.remove)
        }
        Command::Attach(args) => {
            let lock = args.set.open()?;
            say(&format!("attached {} {}", lock.role(), std::process::id()));

            wait_for_eof();

            leave(lock, args.remove)
        }
        Command::TryLock(args) => {
            let lock = args.set.open()?;
            if lock.try_lock(args.slot)? {
                say("acquired");
                lock.unlock(args.slot)?;
            } else {
                say("busy");
            }
            lock.detach()
        }
        Command::Remove(args) => {
            let lock = args.open()?;
            leave(lock, true)
        }
        Command::Stat(args) => {
            let key = IpcKey::resolve(&args.path, args.project)?;
            let Some(set) = SemSet::open(key)? else {
                say("absent");
                return Ok(());
            };
            let values = set.values()?;
            say(&format!("key {key}"));
            say(&format!("id {}", set.id()));
            if let Some((guard, slots)) = values.split_first() {
                say(&format!("attached {}", GUARD_CAPACITY as u16 - guard));
                for (slot, value) in slots.iter().enumerate() {
                    say(&format!("slot {slot} {value}"));
                }
            }
            Ok(())
        }
        Command::Purge(args) => {
            let key = IpcKey::resolve(&args.path, args.project)?;
            if Semlock::purge(key)? {
                say("purged");
            } else {
                say("absent");
            }
            Ok(())
        }
    }
}

fn leave(mut lock: Semlock, remove: bool) -> Result<(), SemlockError> {
    if !remove {
        return lock.detach();
    }
    if lock.remove()? {
        say("removed");
    } else {
        say("in-use");
    }
    Ok(())
}

/// Prints one line and flushes, so a parent reading a pipe sees it at once.
fn say(line: &str) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

/// Blocks until stdin is closed.
fn wait_for_eof() {
    let mut sink = Vec::new();
    let _ = io::stdin().lock().read_to_end(&mut sink);
}
