pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::tail::TailArgs;

#[derive(Debug, Parser)]
#[command(
    name = "caucus",
    about = "Caucus operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, manage group channels and follow them.",
    after_help = "Examples:\n  caucus doctor --json\n  caucus provision --group g-1 --name \"North Side\"\n  caucus sync-members --group g-1\n  caucus tail --channel C0123 --group north-side --notify-stdin"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database, migrations, and Slack bot identity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Follow a channel through the synchronizer and print reconciled messages")]
    Tail {
        #[arg(long, help = "Slack channel id, e.g. C0123456")]
        channel: String,
        #[arg(long, help = "Application group id; defaults to the channel id")]
        group: Option<String>,
        #[arg(long, help = "Stop after this many seconds instead of waiting for Ctrl-C")]
        duration_secs: Option<u64>,
        #[arg(
            long,
            help = "Read activity notifications as JSON lines on stdin and refresh on each one"
        )]
        notify_stdin: bool,
    },
    #[command(about = "Create the Slack channel for a group and record it")]
    Provision {
        #[arg(long, help = "Application group id")]
        group: String,
        #[arg(long, help = "Group name; registers the group when it is not known yet")]
        name: Option<String>,
    },
    #[command(about = "Invite and remove channel members so they match the group")]
    SyncMembers {
        #[arg(long, help = "Application group id")]
        group: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::CommandResult {
            exit_code: commands::Exit::Ok.code(),
            output: commands::config::run(),
        },
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Tail { channel, group, duration_secs, notify_stdin } => {
            commands::tail::run(TailArgs { channel, group, duration_secs, notify_stdin })
        }
        Command::Provision { group, name } => commands::membership::provision(group, name),
        Command::SyncMembers { group } => commands::membership::sync_members(group),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
