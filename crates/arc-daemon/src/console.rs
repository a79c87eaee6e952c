//! Line-oriented console on stdin/stdout.
//!
//! Plain lines are flooded as chat. Lines starting with `/` are commands:
//!
//! | Command | Effect |
//! |---|---|
//! | `/put <text>` | store `<text>` in the DHT, print its root |
//! | `/get <root-hex>` | fetch and print stored data |
//! | `/stats` | print router counters |

use arc_router::RouterHandle;
use arc_transport::Message;
use arc_types::Hash;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Chat(&'a str),
    Put(&'a str),
    Get(&'a str),
    Stats,
    Unknown(&'a str),
}

fn parse(line: &str) -> Option<Line<'_>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Line::Chat(line));
    };
    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    Some(match name {
        "put" => Line::Put(arg),
        "get" => Line::Get(arg.trim()),
        "stats" => Line::Stats,
        _ => Line::Unknown(name),
    })
}

fn parse_root(text: &str) -> anyhow::Result<Hash> {
    let bytes = hex::decode(text)?;
    Hash::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("root must be 32 bytes, got {}", bytes.len()))
}

async fn execute(router: &RouterHandle, line: Line<'_>) -> anyhow::Result<String> {
    Ok(match line {
        Line::Chat(text) => {
            router.inject(Message::chat(text)).await?;
            return Ok(String::new());
        }
        Line::Put(text) => hex::encode(router.insert_data(text.as_bytes()).await?),
        Line::Get(root) => {
            let data = router.fetch(parse_root(root)?).await?;
            String::from_utf8_lossy(&data).into_owned()
        }
        Line::Stats => format!("{:?}", router.stats().await?),
        Line::Unknown(name) => format!("unknown command /{name}"),
    })
}

/// Print chat lines from peers until the router stops.
pub async fn print_chat(router: RouterHandle) {
    let mut chat = router.subscribe();
    let mut stdout = tokio::io::stdout();
    loop {
        match chat.recv().await {
            Ok(message) => {
                let mut line = message.body;
                line.push(b'\n');
                if stdout.write_all(&line).await.is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "console fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

/// Read stdin until EOF.
pub async fn run(router: RouterHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(raw) = lines.next_line().await? {
        let Some(line) = parse(&raw) else {
            continue;
        };
        let output = match execute(&router, line).await {
            Ok(output) => output,
            Err(e) => format!("error: {e:#}"),
        };
        if !output.is_empty() {
            stdout.write_all(output.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
    }
    debug!("console input closed");
    Ok(())
}
