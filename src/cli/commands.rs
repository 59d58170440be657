use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// How read-only commands print their results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormatArg {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormatArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormatArg::Text),
            "json" => Ok(OutputFormatArg::Json),
            _ => Err(format!("Invalid format: {s}. Valid options: text, json")),
        }
    }
}

impl std::fmt::Display for OutputFormatArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormatArg::Text => write!(f, "text"),
            OutputFormatArg::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "page-ledger")]
pub struct Opt {
    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(
        name = "startnode",
        about = "Start a node and read page commands from stdin"
    )]
    StartNode {
        #[arg(long, help = "Relay and validate only, never mine")]
        no_mining: bool,
        #[arg(
            long,
            default_value = "anonymous",
            help = "Name recorded as the signer of submitted pages"
        )]
        username: String,
    },
    #[command(name = "printchain", about = "Print the saved chain")]
    Printchain,
    #[command(
        name = "verifychain",
        about = "Validate the saved chain block by block"
    )]
    Verifychain,
    #[command(
        name = "findtitle",
        about = "List the recorded pages of a document"
    )]
    FindTitle {
        #[arg(help = "Exact document title")]
        title: String,
    },
    #[command(name = "status", about = "Show the node configuration and saved chain")]
    Status {
        #[arg(long, default_value_t = OutputFormatArg::Text, help = "text or json")]
        format: OutputFormatArg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_startnode() {
        let opt = Opt::parse_from([
            "page-ledger",
            "--config",
            "node.toml",
            "startnode",
            "--no-mining",
            "--username",
            "alice",
        ]);
        assert_eq!(opt.config, Some(PathBuf::from("node.toml")));
        match opt.command {
            Command::StartNode {
                no_mining,
                username,
            } => {
                assert!(no_mining);
                assert_eq!(username, "alice");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_status_format() {
        let opt = Opt::parse_from(["page-ledger", "status", "--format", "JSON"]);
        assert!(matches!(
            opt.command,
            Command::Status {
                format: OutputFormatArg::Json
            }
        ));
        assert!("yaml".parse::<OutputFormatArg>().is_err());
    }
}
