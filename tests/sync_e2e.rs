use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use treesync::codec::{read_message, write_message};
use treesync::config::{BackoffConfig, ClientConfig, ServerConfig};
use treesync::logger::NoopLogger;
use treesync::protocol::MAX_CONTENT_SIZE;
use treesync::registry::{hash_bytes, record_for_bytes};
use treesync::server::ServerState;
use treesync::{Client, ClientState, Message, ModTime, Registry, Server};

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

fn server_config(root: &Path) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".into(),
        root: root.to_path_buf(),
        cache: false,
        ..ServerConfig::default()
    }
}

async fn start_server(root: &Path) -> Result<(SocketAddr, Arc<ServerState>, JoinHandle<()>)> {
    start_server_with(server_config(root)).await
}

async fn start_server_with(cfg: ServerConfig) -> Result<(SocketAddr, Arc<ServerState>, JoinHandle<()>)> {
    let server = Server::bind(&cfg, Arc::new(NoopLogger)).await?;
    let addr = server.local_addr()?;
    let state = server.state();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    Ok((addr, state, task))
}

fn start_client(addr: SocketAddr, root: &Path, name: &str) -> Result<(Arc<Client>, JoinHandle<()>)> {
    let cfg = ClientConfig {
        server: addr.to_string(),
        root: root.to_path_buf(),
        name: Some(name.into()),
        settle_ms: 50,
        cooldown_ms: 200,
        backoff: BackoffConfig {
            initial_ms: 50,
            max_ms: 500,
            max_attempts: None,
        },
        ..ClientConfig::default()
    };
    let client = Arc::new(Client::new(cfg, Arc::new(NoopLogger))?);
    let runner = client.clone();
    let task = tokio::spawn(async move {
        let _ = runner.run().await;
    });
    Ok((client, task))
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) -> Result<()> {
    for _ in 0..200u32 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("timed out waiting for {what}")
}

async fn wait_watching(client: &Client) -> Result<()> {
    let mut rx = client.subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|s| *s == ClientState::Watching),
    )
    .await??;
    Ok(())
}

async fn next_message(stream: &mut TcpStream) -> Result<Message> {
    match tokio::time::timeout(Duration::from_secs(5), read_message(stream)).await?? {
        Some(m) => Ok(m),
        None => bail!("server closed the connection"),
    }
}

/// Raw protocol peer: connects and consumes the opening registry
async fn raw_peer(addr: SocketAddr) -> Result<(TcpStream, Registry)> {
    let mut stream = TcpStream::connect(addr).await?;
    match next_message(&mut stream).await? {
        Message::FileRegistry(r) => Ok((stream, r)),
        other => bail!("expected file_registry, got {}", other.tag()),
    }
}

/// Request `path` and skip unrelated notices until the answer arrives
async fn request(stream: &mut TcpStream, path: &str) -> Result<Message> {
    write_message(stream, &Message::RequestFile { path: path.into() }).await?;
    loop {
        match next_message(stream).await? {
            Message::FileUpdated { .. } => continue,
            reply => return Ok(reply),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_and_server_converge_on_union() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    write_file(&cli.path().join("a.txt"), b"only on client")?;
    write_file(&cli.path().join("shared/b.txt"), b"on both")?;
    write_file(&srv.path().join("shared/b.txt"), b"on both")?;
    write_file(&srv.path().join("deep/dir/c.txt"), b"only on server")?;

    let (addr, state, server_task) = start_server(srv.path()).await?;
    let (client, client_task) = start_client(addr, cli.path(), "c1")?;
    wait_watching(&client).await?;

    assert_eq!(std::fs::read(cli.path().join("deep/dir/c.txt"))?, b"only on server");
    wait_until("upload of a.txt", || state.registry_snapshot().contains("a.txt")).await?;
    assert_eq!(std::fs::read(srv.path().join("a.txt"))?, b"only on client");

    let server_paths: Vec<String> = state.registry_snapshot().iter().map(|r| r.relative_path.clone()).collect();
    assert_eq!(server_paths, vec!["a.txt", "deep/dir/c.txt", "shared/b.txt"]);
    let client_paths: Vec<String> = client.registry_snapshot().iter().map(|r| r.relative_path.clone()).collect();
    assert_eq!(client_paths, server_paths);

    client_task.abort();
    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_clients_receive_server_files() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let one = tempfile::tempdir()?;
    let two = tempfile::tempdir()?;
    write_file(&srv.path().join("F.bin"), &vec![7u8; 300_000])?;

    let (addr, _state, server_task) = start_server(srv.path()).await?;
    let (c1, t1) = start_client(addr, one.path(), "one")?;
    let (c2, t2) = start_client(addr, two.path(), "two")?;
    wait_watching(&c1).await?;
    wait_watching(&c2).await?;

    let h1 = c1.registry_snapshot().hash_of("F.bin").map(str::to_string);
    let h2 = c2.registry_snapshot().hash_of("F.bin").map(str::to_string);
    assert!(h1.is_some());
    assert_eq!(h1, h2);
    assert_eq!(std::fs::read(two.path().join("F.bin"))?, vec![7u8; 300_000]);

    // A peer already holding everything gets nothing to pull
    let (mut raw, registry) = raw_peer(addr).await?;
    write_message(&mut raw, &Message::ClientRegistry(c1.registry_snapshot())).await?;
    assert_eq!(next_message(&mut raw).await?, Message::SyncUpdates { files: vec![] });
    write_message(&mut raw, &Message::ClientRegistry(Registry::new())).await?;
    assert_eq!(
        next_message(&mut raw).await?,
        Message::SyncUpdates { files: vec!["F.bin".into()] }
    );
    assert_eq!(registry, c2.registry_snapshot());

    t1.abort();
    t2.abort();
    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_then_request_is_byte_identical() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (addr, state, server_task) = start_server(srv.path()).await?;
    let (mut peer, registry) = raw_peer(addr).await?;
    assert!(registry.is_empty());

    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let record = record_for_bytes("nested/data.bin", &content, ModTime { secs: 1_700_000_000, nanos: 42 });
    write_message(
        &mut peer,
        &Message::UploadFile {
            path: "nested/data.bin".into(),
            record: record.clone(),
            previous_hash: None,
            content: content.clone(),
        },
    )
    .await?;

    match request(&mut peer, "nested/data.bin").await? {
        Message::FileContent { record: got, content: bytes, .. } => {
            assert_eq!(bytes, content);
            assert_eq!(got.content_hash, record.content_hash);
            assert_eq!(got.modified_time, record.modified_time);
        }
        other => bail!("unexpected reply {}", other.tag()),
    }
    assert_eq!(state.registry_snapshot().get("nested/data.bin"), Some(&record));

    assert_eq!(
        request(&mut peer, "missing.txt").await?,
        Message::FileNotFound { path: "missing.txt".into() }
    );

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_and_escaping_uploads_are_rejected() -> Result<()> {
    let top = tempfile::tempdir()?;
    let srv_root = top.path().join("srv");
    let (addr, state, server_task) = start_server(&srv_root).await?;
    let (mut peer, _) = raw_peer(addr).await?;

    let escaping = record_for_bytes("../escape.txt", b"x", ModTime::default());
    write_message(
        &mut peer,
        &Message::UploadFile {
            path: "../escape.txt".into(),
            record: escaping,
            previous_hash: None,
            content: b"x".to_vec(),
        },
    )
    .await?;

    let mut bad = record_for_bytes("bad.txt", b"declared", ModTime::default());
    bad.content_hash = hash_bytes(b"something else");
    write_message(
        &mut peer,
        &Message::UploadFile {
            path: "bad.txt".into(),
            record: bad,
            previous_hash: None,
            content: b"declared".to_vec(),
        },
    )
    .await?;

    // The connection survives both rejections
    assert_eq!(
        request(&mut peer, "bad.txt").await?,
        Message::FileNotFound { path: "bad.txt".into() }
    );
    assert!(!top.path().join("escape.txt").exists());
    assert!(!srv_root.join("bad.txt").exists());
    assert!(state.registry_snapshot().is_empty());

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_reader_with_request_backlog_keeps_its_connection() -> Result<()> {
    let srv = tempfile::tempdir()?;
    for i in 0..40 {
        write_file(&srv.path().join(format!("bulk/{i:02}.bin")), &vec![i as u8; 16 * 1024])?;
    }
    let (addr, state, server_task) = start_server_with(ServerConfig {
        queue_depth: 4,
        ..server_config(srv.path())
    })
    .await?;

    // Ask for everything, then stop reading for a while
    let (mut slow, registry) = raw_peer(addr).await?;
    assert_eq!(registry.len(), 40);
    for r in registry.iter() {
        write_message(&mut slow, &Message::RequestFile { path: r.relative_path.clone() }).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A change elsewhere must not evict the busy reader
    let (mut other, _) = raw_peer(addr).await?;
    let record = record_for_bytes("other.txt", b"news", ModTime { secs: 1_700_000_000, nanos: 0 });
    write_message(
        &mut other,
        &Message::UploadFile {
            path: "other.txt".into(),
            record,
            previous_hash: None,
            content: b"news".to_vec(),
        },
    )
    .await?;
    assert!(matches!(request(&mut other, "other.txt").await?, Message::FileContent { .. }));
    assert_eq!(state.connections().len(), 2);

    let (mut contents, mut notices) = (0, 0);
    while contents < 40 || notices < 1 {
        match next_message(&mut slow).await? {
            Message::FileContent { content, .. } => {
                assert_eq!(content.len(), 16 * 1024);
                contents += 1;
            }
            Message::FileUpdated { path, .. } => {
                assert_eq!(path, "other.txt");
                notices += 1;
            }
            other => bail!("unexpected message {}", other.tag()),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!((contents, notices), (40, 1));

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_file_is_not_found_and_connection_stays_open() -> Result<()> {
    let srv = tempfile::tempdir()?;
    // Sparse, so nothing near the limit is actually written
    let huge = std::fs::File::create(srv.path().join("huge.bin"))?;
    huge.set_len(MAX_CONTENT_SIZE as u64 + 1)?;
    drop(huge);
    write_file(&srv.path().join("small.txt"), b"small")?;

    let (addr, state, server_task) = start_server(srv.path()).await?;
    let (mut peer, registry) = raw_peer(addr).await?;
    assert!(!registry.contains("huge.bin"));
    assert!(registry.contains("small.txt"));

    assert_eq!(
        request(&mut peer, "huge.bin").await?,
        Message::FileNotFound { path: "huge.bin".into() }
    );
    match request(&mut peer, "small.txt").await? {
        Message::FileContent { content, .. } => assert_eq!(content, b"small"),
        other => bail!("unexpected reply {}", other.tag()),
    }
    assert_eq!(state.connections().len(), 1);

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_leave_exactly_one_version() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (addr, state, server_task) = start_server(srv.path()).await?;

    let versions: Vec<Vec<u8>> = vec![vec![b'a'; 150_000], vec![b'b'; 90_000]];
    let mut tasks = Vec::new();
    for (i, content) in versions.iter().cloned().enumerate() {
        tasks.push(tokio::spawn(async move {
            let (mut peer, _) = raw_peer(addr).await?;
            let record = record_for_bytes("contested.bin", &content, ModTime { secs: 100 + i as i64, nanos: 0 });
            write_message(
                &mut peer,
                &Message::UploadFile {
                    path: "contested.bin".into(),
                    record,
                    previous_hash: None,
                    content,
                },
            )
            .await?;
            // Replies are in order, so this one follows the upload
            request(&mut peer, "contested.bin").await
        }));
    }
    for t in tasks {
        t.await??;
    }

    let on_disk = std::fs::read(srv.path().join("contested.bin"))?;
    assert!(versions.contains(&on_disk));
    assert_eq!(
        state.registry_snapshot().hash_of("contested.bin"),
        Some(hash_bytes(&on_disk).as_str())
    );
    assert!(std::fs::read_dir(srv.path())?
        .filter_map(|e| e.ok())
        .all(|e| !e.file_name().to_string_lossy().ends_with(".tmp")));

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_changes_reach_other_clients() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let one = tempfile::tempdir()?;
    let two = tempfile::tempdir()?;

    let (addr, state, server_task) = start_server(srv.path()).await?;
    let (c1, t1) = start_client(addr, one.path(), "writer")?;
    let (c2, t2) = start_client(addr, two.path(), "reader")?;
    wait_watching(&c1).await?;
    wait_watching(&c2).await?;

    write_file(&c1.root().join("notes/today.md"), b"# first draft")?;
    let mirrored = two.path().join("notes/today.md");
    wait_until("propagation to second client", || {
        std::fs::read(&mirrored).map(|d| d == b"# first draft").unwrap_or(false)
    })
    .await?;
    assert_eq!(
        state.registry_snapshot().hash_of("notes/today.md"),
        Some(hash_bytes(b"# first draft").as_str())
    );

    // Edits after the cooldown propagate too
    tokio::time::sleep(Duration::from_millis(300)).await;
    write_file(&c1.root().join("notes/today.md"), b"# second draft")?;
    wait_until("second edit", || {
        std::fs::read(&mirrored).map(|d| d == b"# second draft").unwrap_or(false)
    })
    .await?;

    t1.abort();
    t2.abort();
    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_deletion_is_not_propagated() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    write_file(&srv.path().join("keep.txt"), b"server copy")?;

    let (addr, state, server_task) = start_server(srv.path()).await?;
    let (client, client_task) = start_client(addr, cli.path(), "deleter")?;
    wait_watching(&client).await?;
    assert!(cli.path().join("keep.txt").exists());

    std::fs::remove_file(cli.path().join("keep.txt"))?;
    wait_until("local record dropped", || !client.registry_snapshot().contains("keep.txt")).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(std::fs::read(srv.path().join("keep.txt"))?, b"server copy");
    assert!(state.registry_snapshot().contains("keep.txt"));

    client_task.abort();
    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_reconnects_after_server_restart() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;

    let (addr, state, server_task) = start_server(srv.path()).await?;
    let (client, client_task) = start_client(addr, cli.path(), "roamer")?;
    wait_watching(&client).await?;

    state.close_all();
    server_task.abort();
    let _ = server_task.await;
    let mut rx = client.subscribe();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s != ClientState::Watching)).await??;

    // Same port, new file waiting on the server side
    write_file(&srv.path().join("later.txt"), b"added while away")?;
    let cfg = ServerConfig {
        bind: addr.to_string(),
        root: srv.path().to_path_buf(),
        cache: false,
        ..ServerConfig::default()
    };
    let server = Server::bind(&cfg, Arc::new(NoopLogger)).await?;
    let restarted = tokio::spawn(async move {
        let _ = server.run().await;
    });

    wait_until("resync after reconnect", || cli.path().join("later.txt").exists()).await?;
    wait_watching(&client).await?;

    client_task.abort();
    restarted.abort();
    Ok(())
}
