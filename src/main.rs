// This is my main entry point for the ledger CLI
use clap::Parser;
use log::{error, info, LevelFilter};
use page_ledger::{
    ChainStore, Command, Config, EcdsaP256Signer, EcdsaP256Verifier, FileChainStore, LedgerError,
    Opt, OutputFormatArg, PageRecord, Server, Validator,
};
use page_ledger::{Chain, NodeHandle};
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

fn main() {
    // Info level by default; RUST_LOG still wins when it is set
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(opt.config.as_deref())?;

    match opt.command {
        Command::StartNode {
            no_mining,
            username,
        } => {
            if no_mining {
                config.mining_enabled = false;
            }
            // The key only lives as long as this process
            let signer = EcdsaP256Signer::generate(&username)?;
            let mut node = Server::open(config, Arc::new(EcdsaP256Verifier))?.start()?;
            println!("Node {} listening on {}", node.node_id(), node.listen_addr());
            println!("Commands: status | page <title> <index> <text> | connect <addr> | quit");

            run_console(&node, &signer)?;
            let chain = node.shutdown()?;
            println!("Stopped at height {}", chain.height());
        }
        Command::Printchain => {
            let chain = load_saved_chain(&config)?;
            for block in chain.blocks() {
                println!("Block {}", block.get_index());
                println!("  Hash:       {}", block.hash());
                println!("  Prev hash:  {}", block.get_previous_hash());
                println!("  Timestamp:  {}", block.get_timestamp());
                println!("  Difficulty: {}", block.get_difficulty());
                println!("  Nonce:      {}", block.get_nonce());
                for record in block.get_records() {
                    println!(
                        "  - {} page {} by {} ({})",
                        record.get_title(),
                        record.get_page_index(),
                        record.get_signer().username,
                        record.get_content_hash().short()
                    );
                }
                println!();
            }
        }
        Command::Verifychain => {
            let chain = load_saved_chain(&config)?;
            let validator = Validator::new(Arc::new(EcdsaP256Verifier), config.difficulty_policy());
            validator
                .validate_chain(&chain)
                .map_err(LedgerError::from)?;
            println!("Chain of height {} is valid", chain.height());
        }
        Command::FindTitle { title } => {
            let chain = load_saved_chain(&config)?;
            let pages = chain.find_pages_by_title(&title);
            if pages.is_empty() {
                println!("No pages recorded for '{title}'");
            }
            for record in pages {
                println!("Page {}: {}", record.get_page_index(), record.get_text());
            }
        }
        Command::Status { format } => {
            let chain = match config.chain_file() {
                Some(path) => FileChainStore::new(path).load()?,
                None => None,
            };
            let status = serde_json::json!({
                "node_id": config.node_id,
                "listen_addr": config.listen_addr,
                "bootstrap_peers": config.bootstrap_peers,
                "data_dir": config.data_dir,
                "difficulty": config.difficulty,
                "mining_enabled": config.mining_enabled,
                "saved_height": chain.as_ref().map(Chain::height),
                "saved_tip": chain.as_ref().map(|chain| chain.tip_hash().to_hex()),
            });
            match format {
                OutputFormatArg::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormatArg::Text => {
                    if let Some(fields) = status.as_object() {
                        for (key, value) in fields {
                            println!("{key}: {value}");
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn load_saved_chain(config: &Config) -> Result<Chain, Box<dyn std::error::Error>> {
    let path = config
        .chain_file()
        .ok_or("No data_dir configured, nothing is saved")?;
    let chain = FileChainStore::new(&path).load()?.unwrap_or_default();
    info!("Loaded chain of height {} from {}", chain.height(), path.display());
    Ok(chain)
}

// I read one command per line until stdin closes or I type quit
fn run_console(node: &NodeHandle, signer: &EcdsaP256Signer) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.trim().splitn(4, ' ');
        match parts.next() {
            Some("quit") | Some("exit") => break,
            Some("status") => {
                let status = node.status()?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            Some("page") => {
                let (Some(title), Some(index), Some(text)) = (parts.next(), parts.next(), parts.next())
                else {
                    println!("Usage: page <title> <index> <text>");
                    continue;
                };
                let index: u32 = match index.parse() {
                    Ok(index) => index,
                    Err(_) => {
                        println!("Page index must be a number");
                        continue;
                    }
                };
                let record = PageRecord::new_signed(title, index, text, signer)?;
                println!("Submitting {} ({})", record.get_title(), record.get_content_hash().short());
                node.submit_pages(vec![record])?;
            }
            Some("connect") => match parts.next().map(str::parse::<SocketAddr>) {
                Some(Ok(addr)) => node.connect(addr)?,
                _ => println!("Usage: connect <ip:port>"),
            },
            Some("") | None => {}
            Some(other) => println!("Unknown command: {other}"),
        }
    }
    Ok(())
}
