use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "autopoiesis", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a single task non-interactively and print the batch result.
    Run(RunArgs),

    /// Manage the agent's approval signing keys.
    Keys(KeysArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Agent identity; defaults to $AUTOPOIESIS_AGENT, then "default".
    #[arg(long, short = 'a')]
    pub agent: Option<String>,

    /// Write the batch-result JSON to this file instead of stdout.
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Overall wall-clock timeout for the batch run, in seconds.
    #[arg(long, short = 't')]
    pub timeout: Option<u64>,

    /// Kind of work item to enqueue.
    #[arg(long = "type", value_enum, default_value_t = ItemTypeArg::Chat)]
    pub item_type: ItemTypeArg,

    /// Queue priority.
    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Topic to activate for this work item.
    #[arg(long)]
    pub topic: Option<String>,

    /// Specifies color settings for use in the output.
    #[arg(long = "color", value_enum, default_value_t = Color::Auto)]
    pub color: Color,

    /// The task. Pass `-` (or nothing while piping) to read from stdin.
    pub prompt: Option<String>,
}

#[derive(Parser, Debug)]
pub struct KeysArgs {
    /// Agent identity; defaults to $AUTOPOIESIS_AGENT, then "default".
    #[arg(long, short = 'a')]
    pub agent: Option<String>,

    #[command(subcommand)]
    pub command: KeysCommand,
}

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// Generate the first signing keypair for this agent.
    Init,
    /// Generate a new signing keypair and mark it current.
    Rotate,
    /// Show the keyring state.
    Show,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Color {
    Always,
    Never,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ItemTypeArg {
    Chat,
    Code,
    Review,
    Planning,
}

impl From<ItemTypeArg> for autopoiesis_protocol::WorkItemType {
    fn from(value: ItemTypeArg) -> Self {
        match value {
            ItemTypeArg::Chat => Self::Chat,
            ItemTypeArg::Code => Self::Code,
            ItemTypeArg::Review => Self::Review,
            ItemTypeArg::Planning => Self::Planning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum PriorityArg {
    Critical,
    Normal,
    Low,
}

impl From<PriorityArg> for autopoiesis_protocol::Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Critical => Self::Critical,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::Low => Self::Low,
        }
    }
}
