use anyhow::Result;
use clap::{Parser, Subcommand};
use common::{Command, FilterSpec, Response, SlotState, SupplierStats};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "vtctl")]
#[command(about = "Vitrine slideshow daemon control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the daemon to check if it's running
    Ping,

    /// Show daemon status and the item on screen
    Query,

    /// Show supplier and producer buffers
    Stats,

    /// Skip to the next item
    Next,

    /// Drop all buffered content and start over
    Flush,

    /// Set or clear a producer's filter
    Filter {
        /// Producer name
        producer: String,

        /// Only keep references containing this text
        #[arg(short, long, conflicts_with = "exclude")]
        include: Option<String>,

        /// Drop references containing this text
        #[arg(short, long)]
        exclude: Option<String>,

        /// Also drop content that is already buffered
        #[arg(short, long)]
        flush: bool,
    },

    /// Change a producer's share of the slideshow
    Weight {
        /// Producer name
        producer: String,

        /// Relative weight (positive number)
        weight: f64,
    },

    /// Change the target render size
    Size { width: u32, height: u32 },

    /// Kill the running daemon
    Kill,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Ping => Command::Ping,
        Commands::Query => Command::Query,
        Commands::Stats => Command::Stats,
        Commands::Next => Command::Next,
        Commands::Flush => Command::Flush,
        Commands::Filter {
            producer,
            include,
            exclude,
            flush,
        } => Command::SetFilter {
            producer,
            filter: parse_filter(include, exclude),
            flush,
        },
        Commands::Weight { producer, weight } => Command::SetWeight { producer, weight },
        Commands::Size { width, height } => Command::SetSize { width, height },
        Commands::Kill => Command::Kill,
    };

    match send_command(command).await {
        Ok(response) => {
            handle_response(response);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("\nIs the daemon running? Try starting it with: vitrine");
            std::process::exit(1);
        }
    }
}

/// No pattern clears the filter
fn parse_filter(include: Option<String>, exclude: Option<String>) -> FilterSpec {
    match (include, exclude) {
        (Some(pattern), _) => FilterSpec::include(pattern),
        (None, Some(pattern)) => FilterSpec::exclude(pattern),
        (None, None) => FilterSpec::None,
    }
}

async fn send_command(command: Command) -> Result<Response> {
    let socket_path = common::get_socket_path();

    let stream = UnixStream::connect(&socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let command_json = serde_json::to_string(&command)?;
    writer.write_all(command_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: Response = serde_json::from_str(&response_line)?;
    Ok(response)
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
        Response::Status(status) => {
            println!("Daemon Status:");
            println!("  Version: {}", status.version);
            println!("  Uptime: {}s", status.uptime_secs);
            println!("  Shown: {}", status.shown);
            match status.current {
                Some(current) => {
                    println!("  Current:");
                    println!("    {} ({}, {})", current.reference, current.media.name(), current.producer);
                    if let Some(title) = current.title {
                        println!("    Title: {}", title);
                    }
                    if let Some(date) = current.date {
                        println!("    Date: {}", date);
                    }
                    if let Some(link) = current.link {
                        println!("    Link: {}", link);
                    }
                }
                None => println!("  Current: nothing on screen"),
            }
        }
        Response::Stats(stats) => print_stats(&stats),
        Response::Pong => {
            println!("✓ Daemon is running");
        }
    }
}

fn slot_row(slots: &[SlotState]) -> String {
    slots.iter().map(SlotState::glyph).collect()
}

fn print_stats(stats: &SupplierStats) {
    let occupied: String = stats
        .occupied
        .iter()
        .map(|o| if *o { '#' } else { '.' })
        .collect();

    println!("Supplier:");
    println!("  Size: {}", stats.size);
    println!("  Buffer: [{}]  waiting: {}", occupied, stats.pending);
    println!(
        "  Total weight: {}  max batch: {:.2}  window resets: {}",
        stats.total_weight, stats.max_batch, stats.fairness_resets
    );

    for registration in &stats.registrations {
        println!(
            "  {:<16} weight {:<5} supplied {:>6} (window {}, batch {:.2})  produced {:>6}",
            registration.name,
            registration.weight,
            registration.total_supplied,
            registration.supplied,
            registration.batch,
            registration.total_produced
        );
    }

    println!("Producers:");
    for producer in &stats.producers {
        println!(
            "  {:<16} {:<10} [{}]  filter {}",
            producer.name,
            producer.kind,
            slot_row(&producer.slots),
            producer.filter
        );
        println!(
            "    produced {}  delivered {}  failed {}  discarded {}  waiting {}  internal errors {}",
            producer.produced,
            producer.delivered,
            producer.failed,
            producer.discarded,
            producer.pending,
            producer.internal_errors
        );
    }
}
