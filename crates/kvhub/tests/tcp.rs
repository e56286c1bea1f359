//! TCP transport against an in-process RESP server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use kvhub::{
    ClientError, Commands, ConnectionOptions, ConnectionRegistry, Connector, RespCodec,
    TcpConnector, Value,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;

type Log = Arc<Mutex<Vec<Vec<String>>>>;

/// Start a tiny server; every request is logged as its list of words.
async fn start_server(password: Option<&'static str>) -> (SocketAddr, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::default();
    let store: Arc<Mutex<HashMap<String, String>>> = Arc::default();

    let server_log = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read, mut write) = stream.into_split();
            let log = Arc::clone(&server_log);
            let store = Arc::clone(&store);

            tokio::spawn(async move {
                let mut requests = FramedRead::new(read, RespCodec);
                while let Some(Ok(Value::Array(items))) = requests.next().await {
                    let words: Vec<String> = items
                        .into_iter()
                        .map(|item| match item {
                            Value::Data(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                            other => format!("{:?}", other),
                        })
                        .collect();
                    log.lock().unwrap().push(words.clone());

                    let reply = reply_to(&words, password, &store);
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                    if words[0] == "QUIT" {
                        return;
                    }
                }
            });
        }
    });

    (addr, log)
}

fn reply_to(
    words: &[String],
    password: Option<&str>,
    store: &Mutex<HashMap<String, String>>,
) -> String {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["AUTH", .., given] => match password {
            Some(expected) if *given == expected => "+OK\r\n".to_string(),
            _ => "-WRONGPASS invalid username-password pair\r\n".to_string(),
        },
        ["SELECT", _] | ["CLIENT", "SETNAME", _] | ["QUIT"] => "+OK\r\n".to_string(),
        ["PING"] => "+PONG\r\n".to_string(),
        ["SET", key, value] => {
            store.lock().unwrap().insert(key.to_string(), value.to_string());
            "+OK\r\n".to_string()
        }
        ["GET", key] => match store.lock().unwrap().get(*key) {
            Some(value) => format!("${}\r\n{}\r\n", value.len(), value),
            None => "$-1\r\n".to_string(),
        },
        _ => "-ERR unknown command\r\n".to_string(),
    }
}

fn options_for(addr: SocketAddr) -> ConnectionOptions {
    ConnectionOptions::new(addr.ip().to_string(), addr.port())
}

#[tokio::test]
async fn handshake_runs_before_requests() {
    let (addr, log) = start_server(Some("secret")).await;
    let mut options = options_for(addr);
    options.username = Some("app".to_string());
    options.password = Some("secret".to_string());
    options.db = 2;
    options.connection_name = Some("worker".to_string());

    let registry = ConnectionRegistry::new(TcpConnector);
    let client = registry.create_instance("default", &options);

    client.set("greeting", "hello").await.unwrap();
    assert_eq!(client.get("greeting").await.unwrap().as_deref(), Some("hello"));
    assert_eq!(client.get("missing").await.unwrap(), None);
    client.quit().await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log[0], vec!["AUTH", "app", "secret"]);
    assert_eq!(log[1], vec!["SELECT", "2"]);
    assert_eq!(log[2], vec!["CLIENT", "SETNAME", "worker"]);
    assert_eq!(log[3], vec!["SET", "greeting", "hello"]);
    assert_eq!(log.last().unwrap(), &vec!["QUIT".to_string()]);
}

#[tokio::test]
async fn skips_handshake_steps_that_are_not_configured() {
    let (addr, log) = start_server(None).await;

    let registry = ConnectionRegistry::new(TcpConnector);
    let client = registry.create_instance("default", &options_for(addr));

    assert_eq!(client.ping().await.unwrap(), "PONG");
    assert_eq!(log.lock().unwrap().clone(), vec![vec!["PING".to_string()]]);
}

#[tokio::test]
async fn rejected_auth_fails_the_connection_attempt() {
    let (addr, _log) = start_server(Some("secret")).await;
    let mut options = options_for(addr);
    options.password = Some("wrong".to_string());

    let result = TcpConnector.connect(&options).await;

    assert!(matches!(
        result,
        Err(ClientError::Server(message)) if message.starts_with("WRONGPASS")
    ));
}

#[tokio::test]
async fn refused_connection_is_an_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = TcpConnector.connect(&options_for(addr)).await;

    match result {
        Err(error) => assert!(matches!(error, ClientError::Io(_)) && error.is_retryable()),
        Ok(_) => panic!("connection to a closed port succeeded"),
    }
}
