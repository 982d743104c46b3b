pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tally",
    about = "Tally operator CLI",
    long_about = "Inspect configuration, check readiness, manage the session database, \
                  refresh CRM metadata and ask one-off questions.",
    after_help = concat!(
        "Examples:\n",
        "  tally doctor --json\n",
        "  tally config\n",
        "  tally ask \"How many accounts are in Banking?\"\n",
        "  tally refresh-metadata",
    )
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Apply pending session database migrations and return structured status output"
    )]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, session database, warehouse and metadata readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Answer one question and print every pipeline event as a JSON line")]
    Ask {
        #[arg(required = true, num_args = 1.., help = "Question in natural language")]
        question: Vec<String>,
        #[arg(long, default_value = "tally", help = "Application name owning the session")]
        app: String,
        #[arg(long, default_value = "cli", help = "User owning the session")]
        user: String,
        #[arg(long, help = "Reuse (or create) this session to keep conversation history")]
        session: Option<String>,
    },
    #[command(about = "Rebuild the CRM metadata file from the warehouse")]
    RefreshMetadata {
        #[arg(long, help = "Write to this path instead of metadata.path")]
        output: Option<PathBuf>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Ask { question, app, user, session } => {
            commands::ask::run(commands::ask::AskOptions {
                question: question.join(" "),
                app_name: app,
                user_id: user,
                session_id: session,
            })
        }
        Command::RefreshMetadata { output } => commands::refresh_metadata::run(output),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
