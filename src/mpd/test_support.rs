//! Scripted MPD server for tests.

use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};

use super::ipc::MpdIpc;

/// Expected command lines, each with the lines sent back for it.
pub type Script = Vec<(String, Vec<String>)>;

pub fn script(steps: &[(&str, &[&str])]) -> Script {
  steps
    .iter()
    .map(|(expected, replies)| {
      (
        expected.to_string(),
        replies.iter().map(|line| line.to_string()).collect(),
      )
    })
    .collect()
}

/// Serve `script` over `stream`. Resolves to the command lines received;
/// the connection closes once the script runs out.
pub fn serve(stream: DuplexStream, script: Script) -> JoinHandle<Vec<String>> {
  tokio::spawn(async move {
    let mut framed = Framed::new(stream, LinesCodec::new());
    framed.send("OK MPD 0.23.5").await.unwrap();

    let mut received = Vec::new();
    for (expected, replies) in script {
      let line = framed
        .next()
        .await
        .expect("client closed the connection")
        .expect("unreadable command line");
      assert_eq!(line, expected);
      received.push(line);
      for reply in replies {
        framed.send(reply).await.unwrap();
      }
    }
    received
  })
}

pub async fn connect(script: Script) -> (MpdIpc<DuplexStream>, JoinHandle<Vec<String>>) {
  let (client, server) = tokio::io::duplex(64 * 1024);
  let handle = serve(server, script);
  let ipc = MpdIpc::handshake(client, "localhost", 6600).await.unwrap();
  (ipc, handle)
}
