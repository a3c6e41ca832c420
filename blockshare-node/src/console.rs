//! Line-oriented operator console on stdin/stdout.

use std::sync::Arc;

use blockshare_core::{FileSearchResult, NodeIdentity, SearchGroups};
use blockshare_node::Node;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const HELP: &str = "commands:
  connect <host> <port>   connect and handshake with a peer
  search <word>           search connected peers for file names containing <word>
  download <n>            download result <n> of the last search
  peers                   list known peers
  remove <host> <port>    drop a peer
  files                   rescan and list the local folder
  quit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Connect(NodeIdentity),
    Search(String),
    Download(usize),
    Peers,
    Remove(NodeIdentity),
    Files,
    Help,
    Quit,
}

fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let command = match (cmd, args.as_slice()) {
        ("connect", [host, port]) => Command::Connect(peer(host, port)?),
        ("remove", [host, port]) => Command::Remove(peer(host, port)?),
        ("search", [word]) => Command::Search((*word).to_owned()),
        ("download", [n]) => Command::Download(
            n.parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("not a result number: {n}"))?,
        ),
        ("peers", []) => Command::Peers,
        ("files", []) => Command::Files,
        ("help", []) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        _ => return Err(format!("bad command: {line}")),
    };
    Ok(Some(command))
}

fn peer(host: &str, port: &str) -> Result<NodeIdentity, String> {
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {port}"))?;
    Ok(NodeIdentity::new(host, port))
}

/// One row per distinct content, ordered by file name then hash.
fn rows(groups: SearchGroups) -> Vec<Vec<FileSearchResult>> {
    let mut rows: Vec<Vec<FileSearchResult>> = groups.into_values().filter(|g| !g.is_empty()).collect();
    rows.sort_by(|a, b| {
        (&a[0].file_name, &a[0].content_hash).cmp(&(&b[0].file_name, &b[0].content_hash))
    });
    rows
}

/// Read commands until `quit` or end of input.
pub async fn run(node: Arc<Node>) -> anyhow::Result<()> {
    println!("node {} ready, type `help` for commands", node.identity());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last: Vec<Vec<FileSearchResult>> = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let command = match parse(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match command {
            Command::Connect(peer) => {
                node.connect_async(peer.clone());
                match node.handshake(&peer).await {
                    Ok(()) => println!("connected to {peer}"),
                    Err(e) => println!("{e}"),
                }
            }
            Command::Search(word) => {
                last = rows(node.search(&word).await);
                if last.is_empty() {
                    println!("no results");
                }
                for (i, group) in last.iter().enumerate() {
                    let r = &group[0];
                    println!(
                        "{}. {} ({} bytes) from {} peer(s)",
                        i + 1,
                        r.file_name,
                        r.file_size,
                        group.len()
                    );
                }
            }
            Command::Download(n) => {
                let Some(group) = last.get(n - 1) else {
                    println!("no result {n}");
                    continue;
                };
                match node.download(&group[0].file_name, group).await {
                    Ok(report) => println!("{report}"),
                    Err(e) => println!("{e}"),
                }
            }
            Command::Peers => {
                for peer in node.peers().await {
                    let alive = node.peer(&peer).await.is_some_and(|c| c.is_alive());
                    println!("{peer}{}", if alive { "" } else { " (dead)" });
                }
            }
            Command::Remove(peer) => {
                if !node.remove_peer(&peer).await {
                    println!("unknown peer {peer}");
                }
            }
            Command::Files => {
                if let Err(e) = node.catalog().refresh() {
                    warn!(error = %e, "rescan failed");
                }
                for m in node.catalog().entries() {
                    println!("{} ({} bytes) {}", m.file_name, m.file_size, m.content_hash);
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, hash: &str, port: u16) -> FileSearchResult {
        FileSearchResult {
            file_name: name.into(),
            file_size: 1,
            content_hash: hash.into(),
            responder_host: "h".into(),
            responder_port: port,
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse("connect localhost 9001"),
            Ok(Some(Command::Connect(NodeIdentity::new("localhost", 9001))))
        );
        assert_eq!(parse("  search  notes "), Ok(Some(Command::Search("notes".into()))));
        assert_eq!(parse("download 2"), Ok(Some(Command::Download(2))));
        assert_eq!(parse(""), Ok(None));
        assert!(parse("download 0").is_err());
        assert!(parse("connect localhost port").is_err());
        assert!(parse("search").is_err());
    }

    #[test]
    fn rows_are_sorted_by_name() {
        let groups = blockshare_core::scheduler::group_by_content(vec![
            result("b.txt", "2", 1),
            result("a.txt", "1", 1),
            result("a.txt", "1", 2),
        ]);
        let rows = rows(groups);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0].file_name, "a.txt");
        assert_eq!(rows[0].len(), 2);
    }
}
