//! Interactive line client: every stdin line becomes one frame, every frame
//! from the relay becomes one stdout line.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    frame::{self, FrameError},
};

/// Typing this (any case) sends it and then leaves.
const FAREWELL: &str = "bye";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut incoming, mut writer) = establish_connection(&args).await?;
    let mut lines = BufReader::new(io::stdin()).lines();

    run_client_loop(&mut incoming, &mut writer, &mut lines, args.max_frame_bytes).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Frames arriving from the relay.
///
/// Bytes are accumulated in an owned buffer so that `next` can be dropped
/// inside `select!` without losing part of a frame.
struct IncomingFrames {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    max_frame_len: usize,
}

impl IncomingFrames {
    async fn next(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(payload) = frame::decode_from(&mut self.buffer, self.max_frame_len)? {
                return Ok(Some(payload));
            }
            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
        }
    }
}

async fn establish_connection(args: &ClientArgs) -> Result<(IncomingFrames, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let (reader, writer) = stream.into_split();
    let incoming = IncomingFrames {
        reader,
        buffer: BytesMut::new(),
        max_frame_len: args.max_frame_bytes,
    };
    Ok((incoming, writer))
}

async fn run_client_loop(
    incoming: &mut IncomingFrames,
    writer: &mut OwnedWriteHalf,
    lines: &mut Lines<BufReader<Stdin>>,
    max_frame_len: usize,
) -> Result<()> {
    loop {
        select! {
            relayed = incoming.next() => {
                if !handle_relayed_frame(relayed).await? {
                    break;
                }
            }
            line = lines.next_line() => {
                if !handle_stdin_line(line?, writer, max_frame_len).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relayed_frame(relayed: Result<Option<Bytes>, FrameError>) -> Result<bool> {
    match relayed.context("failed to read from relay")? {
        Some(payload) => {
            write_stdout(&String::from_utf8_lossy(&payload)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_line(
    line: Option<String>,
    writer: &mut OwnedWriteHalf,
    max_frame_len: usize,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    frame::write_frame(writer, text.as_bytes(), max_frame_len)
        .await
        .context("failed to send message")?;

    if text.eq_ignore_ascii_case(FAREWELL) {
        write_stdout("*** leaving").await?;
        return Ok(false);
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
