//! `gemini` - talk to the Gemini web app from the terminal.

mod logging;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use gemini_webapi::{
    ChatSession, ClientConfig, Credentials, GeminiClient, GenerateOptions, Model, ModelOutput,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "gemini", about = "Gemini web client", version)]
struct Cli {
    /// HTTP or SOCKS proxy URL (overrides GEMINI_PROXY)
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    /// Do not rotate cookies in the background
    #[arg(long, global = true)]
    no_refresh: bool,

    /// Debug logging for the client library
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a single question
    Ask {
        prompt: String,
        #[arg(long, default_value = "unspecified")]
        model: Model,
        /// Gem id to use as system prompt
        #[arg(long)]
        gem: Option<String>,
        /// File to attach (repeatable)
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Print the reply as it arrives
        #[arg(long)]
        stream: bool,
        /// Save reply images into this directory
        #[arg(long)]
        save_images: Option<PathBuf>,
    },
    /// Interactive multi-turn chat
    Chat {
        #[arg(long, default_value = "unspecified")]
        model: Model,
        #[arg(long)]
        gem: Option<String>,
    },
    /// List gems
    Gems {
        /// Include hidden predefined gems
        #[arg(long)]
        hidden: bool,
        #[arg(long, default_value = "en")]
        language: String,
        /// Only predefined (true) or only custom (false) gems
        #[arg(long)]
        predefined: Option<bool>,
    },
    /// Create a custom gem
    CreateGem {
        #[arg(long)]
        name: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Delete a custom gem
    DeleteGem { id: String },
}

#[derive(Debug, PartialEq, Eq)]
enum ReplInput {
    Quit,
    Choose(usize),
    Metadata,
    Message(String),
    Empty,
    Invalid(String),
}

fn parse_repl_line(line: &str) -> ReplInput {
    let line = line.trim();
    if line.is_empty() {
        return ReplInput::Empty;
    }
    let Some(command) = line.strip_prefix(':') else {
        return ReplInput::Message(line.to_string());
    };
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "q" | "exit"), None) => ReplInput::Quit,
        (Some("cid"), None) => ReplInput::Metadata,
        (Some("choose"), Some(n)) => match n.parse() {
            Ok(index) => ReplInput::Choose(index),
            Err(_) => ReplInput::Invalid(format!("not a candidate number: {n}")),
        },
        _ => ReplInput::Invalid(format!("unknown command :{command}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let credentials = Credentials::resolve().context("no Gemini cookies configured")?;
    let config = ClientConfig::builder(credentials.secure_1psid)
        .secure_1psidts(credentials.secure_1psidts)
        .proxy(cli.proxy.clone().or(credentials.proxy))
        .timeout(Duration::from_secs(cli.timeout))
        .auto_refresh(!cli.no_refresh)
        .build();
    let client = GeminiClient::new(config)?;
    client
        .initialize(None)
        .await
        .context("session bootstrap failed; check your cookies")?;
    tracing::debug!(has_session = client.session().session_id.is_some(), "client ready");

    let result = run(&client, cli.command).await;
    client.close();
    result
}

async fn run(client: &GeminiClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ask {
            prompt,
            model,
            gem,
            files,
            stream,
            save_images,
        } => {
            let options = GenerateOptions {
                model,
                gem,
                files,
            };
            let output = if stream {
                let mut chunks = client.generate_content_stream(&prompt, &options).await?;
                while let Some(chunk) = chunks.next().await {
                    print_delta(&chunk?)?;
                }
                println!();
                chunks
                    .take_terminal()
                    .context("reply stream ended early")?
            } else {
                let output = client.generate_content(&prompt, &options).await?;
                println!("{output}");
                output
            };
            if let Some(dir) = save_images {
                for image in &output.images {
                    if let Some(path) = client.save_image(image, &dir, None, true).await? {
                        println!("saved {}", path.display());
                    }
                }
            }
        }
        Command::Chat { model, gem } => {
            let chat = client.start_chat(model, gem)?;
            repl(chat).await?;
        }
        Command::Gems {
            hidden,
            language,
            predefined,
        } => {
            let jar = client.fetch_gems(hidden, &language).await?;
            for gem in jar.filter(predefined).iter() {
                let kind = if gem.predefined { "system" } else { "custom" };
                println!("{:<24} {:<8} {}", gem.id, kind, gem.name);
            }
        }
        Command::CreateGem {
            name,
            prompt,
            description,
        } => {
            let gem = client.create_gem(&name, &prompt, &description).await?;
            println!("created gem {} ({})", gem.name, gem.id);
        }
        Command::DeleteGem { id } => {
            client.delete_gem(&id).await?;
            println!("deleted gem {id}");
        }
    }
    Ok(())
}

fn print_delta(chunk: &ModelOutput) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{}", chunk.text_delta)?;
    stdout.flush()?;
    Ok(())
}

async fn repl(mut chat: ChatSession) -> anyhow::Result<()> {
    eprintln!("chatting with {}; :choose N picks a candidate, :quit exits", chat.model());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_repl_line(&line) {
            ReplInput::Quit => break,
            ReplInput::Empty => {}
            ReplInput::Invalid(message) => eprintln!("{message}"),
            ReplInput::Metadata => println!("{}", chat.metadata()),
            ReplInput::Choose(index) => match chat.choose_candidate(index) {
                Ok(candidate) => println!("{candidate}"),
                Err(e) => eprintln!("{e}"),
            },
            ReplInput::Message(message) => {
                let mut stream = chat.send_message_stream(&message).await?;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => print_delta(&chunk)?,
                        Err(e) => {
                            eprintln!("\nerror: {e}");
                            break;
                        }
                    }
                }
                println!();
                let alternatives = stream
                    .terminal()
                    .map(|t| t.candidates.len())
                    .unwrap_or_default();
                drop(stream);
                if alternatives > 1 {
                    eprintln!("({alternatives} candidates; :choose N to switch)");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_ask_with_model_and_files() {
        let cli = Cli::try_parse_from([
            "gemini", "--timeout", "10", "ask", "hello", "--model", "pro", "--file", "a.png",
            "--file", "b.txt",
        ])
        .unwrap();
        assert_eq!(cli.timeout, 10);
        match cli.command {
            Command::Ask {
                prompt,
                model,
                files,
                stream,
                ..
            } => {
                assert_eq!(prompt, "hello");
                assert_eq!(model, Model::Pro);
                assert_eq!(files, vec![PathBuf::from("a.png"), PathBuf::from("b.txt")]);
                assert!(!stream);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_model() {
        assert!(Cli::try_parse_from(["gemini", "chat", "--model", "gpt"]).is_err());
    }

    #[test]
    fn parses_gems_filter() {
        let cli =
            Cli::try_parse_from(["gemini", "gems", "--predefined", "false", "--hidden"]).unwrap();
        match cli.command {
            Command::Gems {
                hidden,
                predefined,
                language,
            } => {
                assert!(hidden);
                assert_eq!(predefined, Some(false));
                assert_eq!(language, "en");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn repl_commands() {
        assert_eq!(parse_repl_line(":quit"), ReplInput::Quit);
        assert_eq!(parse_repl_line("  "), ReplInput::Empty);
        assert_eq!(parse_repl_line(":choose 2"), ReplInput::Choose(2));
        assert_eq!(parse_repl_line(":cid"), ReplInput::Metadata);
        assert!(matches!(parse_repl_line(":choose x"), ReplInput::Invalid(_)));
        assert!(matches!(parse_repl_line(":nope"), ReplInput::Invalid(_)));
        assert_eq!(
            parse_repl_line("what is rust?"),
            ReplInput::Message("what is rust?".to_string())
        );
    }

    #[test]
    fn verbose_filter_enables_library_debug() {
        assert!(logging::default_filter(true).contains("gemini_webapi=debug"));
        assert_eq!(logging::default_filter(false), "warn");
    }
}
