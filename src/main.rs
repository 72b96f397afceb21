use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use muster::commands::{self, agent_or_env};
use muster::output::Format;
use muster::store::agents::AgentStatus;
use muster::store::ports::PortRange;

#[derive(Parser)]
#[command(
    name = "muster",
    version,
    long_version = muster::build_info::LONG_VERSION,
    about = "Coordinate concurrent coding agents in one repository"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Log more to stderr (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .muster/ in the current directory
    Init,
    /// Durable mail between agents
    Mail {
        #[command(subcommand)]
        action: MailAction,
    },
    /// Port range allocation
    Ports {
        #[command(subcommand)]
        action: PortsAction,
    },
    /// Background process registry
    Process {
        #[command(subcommand)]
        action: ProcessAction,
    },
    /// Agent lifecycle: worktree, branch, ports
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Reconcile processes, drop stale temp files, report leftovers
    Gc {
        /// Minimum age in seconds before an orphaned temp file is removed
        #[arg(long, default_value_t = commands::gc::DEFAULT_TEMP_AGE.as_secs())]
        temp_age_secs: u64,
    },
}

#[derive(Subcommand)]
enum MailAction {
    /// Send a message to one or more agents
    Send {
        /// Sender (defaults to $MUSTER_AGENT)
        #[arg(long)]
        from: Option<String>,
        /// Recipients (repeatable or comma-separated)
        #[arg(long, required = true, value_delimiter = ',')]
        to: Vec<String>,
        /// Subject line
        #[arg(long)]
        subject: String,
        /// Message body
        #[arg(long)]
        body: String,
    },
    /// List messages addressed to an agent, oldest first
    Inbox {
        /// Agent (defaults to $MUSTER_AGENT)
        #[arg(long)]
        agent: Option<String>,
        /// Only messages this agent has not read
        #[arg(long)]
        unread: bool,
    },
    /// Show a message and mark it read
    Read {
        /// Message ID
        #[arg(long)]
        id: String,
        /// Reader (defaults to $MUSTER_AGENT)
        #[arg(long)]
        agent: Option<String>,
    },
    /// Delete a message for every recipient
    Delete {
        /// Message ID
        #[arg(long)]
        id: String,
        /// Deleting agent, for the log (defaults to $MUSTER_AGENT)
        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Subcommand)]
enum PortsAction {
    /// Reserve the lowest free contiguous range
    Allocate {
        /// Number of ports (defaults to ports.width from config)
        #[arg(long)]
        size: Option<u16>,
        /// Who holds the range
        #[arg(long)]
        owner: String,
    },
    /// Return a range to the pool
    Release {
        /// Range as START-END, exactly as allocated
        #[arg(long)]
        range: String,
    },
    /// List current allocations
    List,
}

#[derive(Subcommand)]
enum ProcessAction {
    /// Spawn a detached process under a name
    Start {
        /// Registry name
        #[arg(long)]
        name: String,
        /// Working directory (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Command and arguments, after `--`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Terminate a process, escalating to SIGKILL after the timeout
    Stop {
        /// Registry name
        #[arg(long)]
        name: String,
        /// Seconds to wait after SIGTERM (defaults to processes.stop_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop, then start again with the same command
    Restart {
        /// Registry name
        #[arg(long)]
        name: String,
        /// Seconds to wait after SIGTERM
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List registered processes with live status
    List,
    /// Show one process
    Show {
        /// Registry name
        #[arg(long)]
        name: String,
    },
    /// Print a process's captured output
    Logs {
        /// Registry name
        #[arg(long)]
        name: String,
        /// Only the last N lines
        #[arg(long)]
        tail: Option<usize>,
        /// Keep printing new output until the process exits
        #[arg(long, short)]
        follow: bool,
    },
    /// Forget a stopped or failed process and delete its log
    Deregister {
        /// Registry name
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Provision a worktree, branch and port range for a new agent
    Create {
        /// Agent name
        #[arg(long)]
        name: String,
        /// Task description written into the workspace
        #[arg(long)]
        task: String,
    },
    /// List agents
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<AgentStatus>,
    },
    /// Show one agent
    Show {
        /// Agent name
        #[arg(long)]
        name: String,
    },
    /// Mark an active agent's task as finished
    Complete {
        /// Agent name
        #[arg(long)]
        name: String,
    },
    /// Remove the agent's worktree and branch and release its ports
    Cleanup {
        /// Agent name
        #[arg(long)]
        name: String,
    },
}

fn run(cli: Cli, format: Format) -> muster::error::Result<()> {
    if let Commands::Init = cli.command {
        let cwd = std::env::current_dir()?;
        return commands::init::run(&cwd, format);
    }

    let root = muster::store::repo::find_repo_root()?;

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Mail { action } => match action {
            MailAction::Send {
                from,
                to,
                subject,
                body,
            } => {
                let from = agent_or_env(from, "--from")?;
                commands::mail::send(&root, &from, &to, &subject, &body, format)
            }
            MailAction::Inbox { agent, unread } => {
                let agent = agent_or_env(agent, "--agent")?;
                commands::mail::inbox(&root, &agent, unread, format)
            }
            MailAction::Read { id, agent } => {
                let agent = agent_or_env(agent, "--agent")?;
                commands::mail::read(&root, &id, &agent, format)
            }
            MailAction::Delete { id, agent } => {
                let agent = agent.or_else(muster::agent::resolve_agent);
                commands::mail::delete(&root, &id, agent.as_deref(), format)
            }
        },
        Commands::Ports { action } => match action {
            PortsAction::Allocate { size, owner } => {
                commands::ports::allocate(&root, size, &owner, format)
            }
            PortsAction::Release { range } => {
                let range: PortRange = range.parse()?;
                commands::ports::release(&root, range, format)
            }
            PortsAction::List => commands::ports::list(&root, format),
        },
        Commands::Process { action } => match action {
            ProcessAction::Start { name, cwd, command } => {
                let cwd = match cwd {
                    Some(cwd) => cwd,
                    None => std::env::current_dir()?,
                };
                commands::process::start(&root, &name, &command, &cwd, format)
            }
            ProcessAction::Stop { name, timeout } => {
                commands::process::stop(&root, &name, timeout, format)
            }
            ProcessAction::Restart { name, timeout } => {
                commands::process::restart(&root, &name, timeout, format)
            }
            ProcessAction::List => commands::process::list(&root, format),
            ProcessAction::Show { name } => commands::process::show(&root, &name, format),
            ProcessAction::Logs { name, tail, follow } => {
                commands::process::logs(&root, &name, tail, follow)
            }
            ProcessAction::Deregister { name } => {
                commands::process::deregister(&root, &name, format)
            }
        },
        Commands::Agent { action } => match action {
            AgentAction::Create { name, task } => {
                commands::agent::create(&root, &name, &task, format)
            }
            AgentAction::List { status } => commands::agent::list(&root, status, format),
            AgentAction::Show { name } => commands::agent::show(&root, &name, format),
            AgentAction::Complete { name } => commands::agent::complete(&root, &name, format),
            AgentAction::Cleanup { name } => commands::agent::cleanup(&root, &name, format),
        },
        Commands::Gc { temp_age_secs } => {
            commands::gc::run(&root, Duration::from_secs(temp_age_secs), format)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    muster::logging::init(cli.verbose);

    if let Err(e) = run(cli, format) {
        muster::output::print_error(&e, format);
        std::process::exit(e.kind().exit_code());
    }
}
