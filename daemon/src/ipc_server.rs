use anyhow::Result;
use common::{Command, DaemonStatus, Response, VitrineError};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};

use crate::DaemonState;
use crate::slideshow::SlideshowCommand;
use crate::supplier::Supplier;

/// Everything a client connection can act on
#[derive(Clone)]
pub struct IpcContext {
    pub state: Arc<Mutex<DaemonState>>,
    pub supplier: Supplier,
    pub slideshow_tx: mpsc::UnboundedSender<SlideshowCommand>,
}

pub async fn start(context: IpcContext) -> Result<()> {
    start_at(&common::get_socket_path(), context).await
}

pub async fn start_at(socket_path: &Path, context: IpcContext) -> Result<()> {
    // Remove old socket if it exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    log::info!("IPC server listening on: {}", socket_path.display());

    loop {
        if context.state.lock().await.should_exit {
            break;
        }

        // Accept with a timeout so the exit flag is polled
        let accept_result =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;

        match accept_result {
            Ok(Ok((stream, _addr))) => {
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, context).await {
                        log::error!("Error handling client: {}", e);
                    }
                });
            }
            Ok(Err(e)) => {
                log::error!("Error accepting connection: {}", e);
            }
            Err(_) => continue,
        }
    }

    let _ = std::fs::remove_file(socket_path);
    log::info!("IPC server stopped");
    Ok(())
}

async fn handle_client(stream: UnixStream, context: IpcContext) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle_command(command, &context).await,
            Err(e) => {
                log::warn!("Invalid command: {}", e);
                Response::Error(VitrineError::Ipc(format!("Invalid command: {}", e)))
            }
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Map a pipeline result onto the wire
fn respond(result: crate::Result<()>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(e.into()),
    }
}

pub async fn handle_command(command: Command, context: &IpcContext) -> Response {
    log::debug!("Handling command: {:?}", command);

    match command {
        Command::Ping => Response::Pong,

        Command::Query => {
            let state = context.state.lock().await;
            Response::Status(DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: state.uptime_secs(),
                shown: state.shown,
                current: state.current.clone(),
            })
        }

        Command::Stats => match context.supplier.stats().await {
            Ok(stats) => Response::Stats(stats),
            Err(e) => Response::Error(e.into()),
        },

        Command::Next => match context.slideshow_tx.send(SlideshowCommand::Next) {
            Ok(()) => Response::Ok,
            Err(_) => Response::Error(VitrineError::Ipc("Slideshow is not running".to_string())),
        },

        Command::Flush => {
            log::info!("Flushing all producers");
            respond(context.supplier.flush().await)
        }

        Command::SetFilter {
            producer,
            filter,
            flush,
        } => {
            log::info!("Setting filter of '{}' to {}", producer, filter);
            let handle = match context.supplier.producer(&producer).await {
                Ok(handle) => handle,
                Err(e) => return Response::Error(e.into()),
            };
            if let Err(e) = handle.set_filter(filter) {
                return Response::Error(e.into());
            }
            if flush {
                respond(context.supplier.flush_producer(&producer).await)
            } else {
                Response::Ok
            }
        }

        Command::SetWeight { producer, weight } => {
            respond(context.supplier.set_weight(&producer, weight).await)
        }

        Command::SetSize { width, height } => {
            if width == 0 || height == 0 {
                return Response::Error(VitrineError::InvalidArgument(format!(
                    "Invalid size {}x{}",
                    width, height
                )));
            }
            respond(context.supplier.set_size(width, height))
        }

        Command::Kill => {
            log::info!("Received kill command");
            context.state.lock().await.should_exit = true;
            Response::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{Producer, ProducerConfig};
    use crate::supplier::SupplierConfig;
    use crate::testing::SequenceSource;
    use common::FilterSpec;
    use std::time::Duration;

    async fn context() -> (IpcContext, mpsc::UnboundedReceiver<SlideshowCommand>) {
        let supplier = Supplier::spawn(SupplierConfig::default());
        let producer = Producer::spawn(
            ProducerConfig::new("photos").with_retry_delay(Duration::ZERO),
            SequenceSource::instant("photo"),
        );
        supplier.register(producer).await.unwrap();

        let (slideshow_tx, slideshow_rx) = mpsc::unbounded_channel();
        let context = IpcContext {
            state: Arc::new(Mutex::new(DaemonState::new())),
            supplier,
            slideshow_tx,
        };
        (context, slideshow_rx)
    }

    #[tokio::test]
    async fn test_ping_and_query() {
        let (context, _rx) = context().await;
        assert!(matches!(
            handle_command(Command::Ping, &context).await,
            Response::Pong
        ));

        match handle_command(Command::Query, &context).await {
            Response::Status(status) => {
                assert_eq!(status.shown, 0);
                assert!(status.current.is_none());
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stats_lists_producers() {
        let (context, _rx) = context().await;
        match handle_command(Command::Stats, &context).await {
            Response::Stats(stats) => {
                assert_eq!(stats.registrations.len(), 1);
                assert_eq!(stats.producers[0].name, "photos");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_next_reaches_slideshow() {
        let (context, mut rx) = context().await;
        assert!(matches!(
            handle_command(Command::Next, &context).await,
            Response::Ok
        ));
        assert_eq!(rx.recv().await, Some(SlideshowCommand::Next));

        drop(rx);
        assert!(matches!(
            handle_command(Command::Next, &context).await,
            Response::Error(VitrineError::Ipc(_))
        ));
    }

    #[tokio::test]
    async fn test_set_filter() {
        let (context, _rx) = context().await;
        let command = Command::SetFilter {
            producer: "photos".to_string(),
            filter: FilterSpec::exclude("x"),
            flush: true,
        };
        assert!(matches!(handle_command(command, &context).await, Response::Ok));

        let producer = context.supplier.producer("photos").await.unwrap();
        assert_eq!(
            producer.stats().await.unwrap().filter,
            FilterSpec::exclude("x")
        );

        let unknown = Command::SetFilter {
            producer: "nope".to_string(),
            filter: FilterSpec::None,
            flush: false,
        };
        assert!(matches!(
            handle_command(unknown, &context).await,
            Response::Error(VitrineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (context, _rx) = context().await;
        let weight = Command::SetWeight {
            producer: "photos".to_string(),
            weight: 0.0,
        };
        assert!(matches!(
            handle_command(weight, &context).await,
            Response::Error(VitrineError::InvalidArgument(_))
        ));

        let size = Command::SetSize {
            width: 0,
            height: 600,
        };
        assert!(matches!(
            handle_command(size, &context).await,
            Response::Error(VitrineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_and_kill() {
        let (context, _rx) = context().await;
        assert!(matches!(
            handle_command(Command::Flush, &context).await,
            Response::Ok
        ));
        assert!(matches!(
            handle_command(Command::Kill, &context).await,
            Response::Ok
        ));
        assert!(context.state.lock().await.should_exit);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (context, _rx) = context().await;
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("vitrine.sock");

        let server_path = socket_path.clone();
        let server_context = context.clone();
        let server = tokio::spawn(async move { start_at(&server_path, server_context).await });

        let stream = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match UnixStream::connect(&socket_path).await {
                    Ok(stream) => return stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .unwrap();

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"{\"nonsense\": true}\n").await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert!(matches!(
            serde_json::from_str::<Response>(&line).unwrap(),
            Response::Error(VitrineError::Ipc(_))
        ));

        line.clear();
        let ping = serde_json::to_string(&Command::Ping).unwrap();
        writer.write_all(format!("{}\n", ping).as_bytes()).await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert!(matches!(
            serde_json::from_str::<Response>(&line).unwrap(),
            Response::Pong
        ));

        context.state.lock().await.should_exit = true;
        server.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
