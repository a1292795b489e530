//! Echo sessions driven by the command-line tools

use anyhow::{bail, Context};
use ktn::{Connection, ConnectionStats, Delivery};

/// How the client ends its session once every line has been echoed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFinish {
    /// Close the connection ourselves
    Close,
    /// Wait for the server to close and read the end of stream
    AwaitEndOfStream,
}

/// Send each line, collect the echoes, then finish as requested.
///
/// Returns the echoes and the connection's counters from before teardown.
pub fn run_client(
    connection: &mut Connection,
    lines: &[String],
    finish: ClientFinish,
) -> anyhow::Result<(Vec<String>, ConnectionStats)> {
    let mut echoes = Vec::with_capacity(lines.len());
    for line in lines {
        connection.send(line)?;
        match connection.receive()? {
            Delivery::Data(echo) => echoes.push(echo),
            Delivery::EndOfStream => bail!("server closed the connection early"),
        }
    }

    let stats = connection.stats();
    match finish {
        ClientFinish::Close => connection.close()?,
        ClientFinish::AwaitEndOfStream => match connection.receive()? {
            Delivery::EndOfStream => {}
            Delivery::Data(extra) => bail!("expected end of stream, got {:?}", extra),
        },
    }
    Ok((echoes, stats))
}

/// Echo received lines until the peer closes or, with `close_after`, until
/// that many lines were echoed and the server closes itself.
///
/// Returns the number of lines echoed.
pub fn serve(connection: &mut Connection, close_after: Option<usize>) -> anyhow::Result<usize> {
    let remote = connection
        .remote_endpoint()
        .context("accepted connection has no remote endpoint")?;
    tracing::info!("Serving {}", remote);

    let mut echoed = 0;
    while close_after != Some(echoed) {
        match connection.receive()? {
            Delivery::Data(line) => {
                tracing::info!("{} -> {:?}", remote, line);
                connection.send(&line)?;
                echoed += 1;
            }
            Delivery::EndOfStream => return Ok(echoed),
        }
    }

    tracing::info!("Closing {} after {} lines", remote, echoed);
    connection.close()?;
    Ok(echoed)
}
