//! Load generator for the audio gateway
//!
//! Runs N concurrent streaming clients against the `/audio` endpoint, either
//! borrowing connections from a [`ConnectionPool`] or dialling one direct
//! connection each, and reports per-client and aggregate throughput.

use futures_util::SinkExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::TuningArgs;
use crate::pool::{
    spawn_cleanup_task, ConnectionFactory, ConnectionPool, PoolStats, PooledConnection,
    Transport, WebSocketFactory, WsConnection,
};
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::types::{GatewayError, Result};

/// Delay between client start-ups
pub const CLIENT_STAGGER: Duration = Duration::from_millis(50);

/// Bound on a single chunk write
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client id sent on pooled connections, which are shared between clients
pub const POOL_CLIENT_ID: &str = "tuning-pool";

const CLIENT_ID_HEADER: &str = "X-Client-ID";

/// Counters for one streaming client
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub client: usize,
    pub connected: bool,
    pub sent_chunks: usize,
    pub bytes_sent: u64,
    pub errors: usize,
    pub duration: Duration,
}

impl ClientStats {
    fn new(client: usize) -> Self {
        Self {
            client,
            ..Default::default()
        }
    }

    /// KB/s over the client's own streaming time
    pub fn throughput_kbps(&self) -> f64 {
        kbps(self.bytes_sent, self.duration)
    }
}

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[client-{:03}] chunks={} bytes={} errors={} duration={:.2}s throughput={:.2}KB/s",
            self.client,
            self.sent_chunks,
            self.bytes_sent,
            self.errors,
            self.duration.as_secs_f64(),
            self.throughput_kbps()
        )
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct LoadTestReport {
    pub clients: Vec<ClientStats>,
    pub total_duration: Duration,
    /// Pool state just before the pool was shut down
    pub pool: Option<PoolStats>,
}

impl LoadTestReport {
    pub fn total_chunks(&self) -> usize {
        self.clients.iter().map(|c| c.sent_chunks).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.clients.iter().map(|c| c.bytes_sent).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.clients.iter().map(|c| c.errors).sum()
    }

    pub fn throughput_kbps(&self) -> f64 {
        kbps(self.total_bytes(), self.total_duration)
    }

    pub fn average_client_kbps(&self) -> f64 {
        if self.clients.is_empty() {
            return 0.0;
        }
        self.throughput_kbps() / self.clients.len() as f64
    }
}

impl fmt::Display for LoadTestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for client in &self.clients {
            writeln!(f, "{}", client)?;
        }
        writeln!(f, "total chunks:      {}", self.total_chunks())?;
        writeln!(
            f,
            "total bytes:       {} ({:.2} MB)",
            self.total_bytes(),
            self.total_bytes() as f64 / 1024.0 / 1024.0
        )?;
        writeln!(f, "total errors:      {}", self.total_errors())?;
        writeln!(f, "elapsed:           {:.2}s", self.total_duration.as_secs_f64())?;
        writeln!(f, "throughput:        {:.2} KB/s", self.throughput_kbps())?;
        write!(f, "per-client avg:    {:.2} KB/s", self.average_client_kbps())?;
        if let Some(pool) = &self.pool {
            write!(
                f,
                "\npool:              total={} active={} idle={} created={} reused={} handed_off={} errors={}",
                pool.total,
                pool.active,
                pool.idle,
                pool.created,
                pool.reused,
                pool.handed_off,
                pool.errors
            )?;
        }
        Ok(())
    }
}

fn kbps(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / secs / 1024.0
}

/// Synthetic chunk whose content depends on the client number
pub fn build_chunk(client: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| ((client + i) % 256) as u8).collect()
}

/// Write the sequence number as four ASCII digits at the start of the chunk
pub fn stamp_sequence(chunk: &mut [u8], sequence: usize) {
    let digits = format!("{:04}", sequence % 10_000);
    let n = chunk.len().min(4);
    chunk[..n].copy_from_slice(&digits.as_bytes()[..n]);
}

/// Connection held by a client for the length of its stream
enum Link {
    Pooled(PooledConnection<WsConnection>),
    Direct(WsConnection),
}

impl Link {
    fn socket(&mut self) -> &mut WsConnection {
        match self {
            Link::Pooled(conn) => conn.conn_mut(),
            Link::Direct(conn) => conn,
        }
    }
}

/// One simulated streaming client
pub struct StreamClient {
    id: usize,
    args: Arc<TuningArgs>,
    pool: Option<Arc<ConnectionPool<WebSocketFactory>>>,
}

impl StreamClient {
    pub fn new(
        id: usize,
        args: Arc<TuningArgs>,
        pool: Option<Arc<ConnectionPool<WebSocketFactory>>>,
    ) -> Self {
        Self { id, args, pool }
    }

    async fn connect(&self) -> Result<Link> {
        match &self.pool {
            Some(pool) => pool.get().await.map(Link::Pooled),
            None => {
                let options = self
                    .args
                    .pool_config()
                    .connection_options()
                    .with_header(CLIENT_ID_HEADER, format!("tune-client-{:03}", self.id));
                WebSocketFactory::new(options)
                    .create_connection()
                    .await
                    .map(Link::Direct)
            }
        }
    }

    /// Connect, stream until the chunk count or the deadline is reached, and
    /// hand the connection back
    pub async fn run(self, mut shutdown: ShutdownListener) -> ClientStats {
        let started = Instant::now();
        let mut stats = ClientStats::new(self.id);

        let connected = tokio::select! {
            result = self.connect() => result,
            _ = shutdown.cancelled() => {
                debug!("[client-{:03}] stopped before connecting", self.id);
                stats.duration = started.elapsed();
                return stats;
            }
        };
        let mut link = match connected {
            Ok(link) => link,
            Err(e) => {
                warn!("[client-{:03}] connect failed: {}", self.id, e);
                stats.errors += 1;
                stats.duration = started.elapsed();
                return stats;
            }
        };
        stats.connected = true;
        info!("[client-{:03}] connected", self.id);

        let healthy = self
            .stream(&mut link, &mut stats, started + self.args.test_duration(), &mut shutdown)
            .await;
        stats.duration = started.elapsed();
        self.release(link, healthy).await;
        stats
    }

    /// Returns false once a write has failed
    async fn stream(
        &self,
        link: &mut Link,
        stats: &mut ClientStats,
        deadline: Instant,
        shutdown: &mut ShutdownListener,
    ) -> bool {
        let period = self.args.chunk_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut chunk = build_chunk(self.id, self.args.chunk_size);
        let mut healthy = true;

        while stats.sent_chunks < self.args.chunks_per_client {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shutdown.cancelled() => break,
            }

            stamp_sequence(&mut chunk, stats.sent_chunks);
            let send = link.socket().send(Message::Binary(chunk.clone()));
            let outcome = match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(GatewayError::from(e)),
                Err(_) => Err(GatewayError::WebSocket(format!(
                    "write timed out after {:?}",
                    WRITE_TIMEOUT
                ))),
            };

            match outcome {
                Ok(()) => {
                    stats.sent_chunks += 1;
                    stats.bytes_sent += chunk.len() as u64;
                    if stats.sent_chunks % 10 == 0 {
                        debug!("[client-{:03}] sent {} chunks", self.id, stats.sent_chunks);
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    healthy = false;
                    warn!(
                        "[client-{:03}] chunk {} failed: {}",
                        self.id, stats.sent_chunks, e
                    );
                }
            }
        }
        healthy
    }

    async fn release(&self, link: Link, healthy: bool) {
        match (link, &self.pool) {
            (Link::Pooled(conn), Some(pool)) => {
                let released = if healthy {
                    pool.put(conn).await
                } else {
                    pool.close(conn).await
                };
                if let Err(e) = released {
                    debug!("[client-{:03}] release failed: {}", self.id, e);
                }
            }
            (Link::Pooled(conn), None) => {
                Transport::close(&mut conn.into_inner(), "test complete").await;
            }
            (Link::Direct(mut conn), _) => Transport::close(&mut conn, "test complete").await,
        }
    }
}

/// Run the whole load test described by `args`.
///
/// Once `shutdown` fires no further clients are started, and clients still
/// connecting or waiting on the pool give up.
pub async fn run_load_test(
    args: TuningArgs,
    mut shutdown: ShutdownListener,
) -> Result<LoadTestReport> {
    args.validate().map_err(GatewayError::Config)?;
    let args = Arc::new(args);

    let pool = if args.use_connection_pool {
        let config = args.pool_config();
        let factory = WebSocketFactory::new(
            config
                .connection_options()
                .with_header(CLIENT_ID_HEADER, POOL_CLIENT_ID),
        );
        info!("Connection pool ready (max {} connections)", config.max_pool_size);
        Some(Arc::new(ConnectionPool::new(config, factory)))
    } else {
        None
    };

    let cleanup_stop = Shutdown::new();
    let cleanup = pool
        .as_ref()
        .map(|pool| spawn_cleanup_task(Arc::clone(pool), cleanup_stop.subscribe()));

    info!("Starting {} clients against {}", args.client_count, args.server_url);
    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.client_count);
    for id in 1..=args.client_count {
        if shutdown.is_cancelled() {
            info!("Interrupted, {} of {} clients started", id - 1, args.client_count);
            break;
        }
        let client = StreamClient::new(id, Arc::clone(&args), pool.clone());
        handles.push(tokio::spawn(client.run(shutdown.clone())));
        if id < args.client_count {
            tokio::select! {
                _ = tokio::time::sleep(CLIENT_STAGGER) => {}
                _ = shutdown.cancelled() => {}
            }
        }
    }

    let mut clients = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(stats) => clients.push(stats),
            Err(e) => warn!("Client task ended abnormally: {}", e),
        }
    }
    let total_duration = started.elapsed();

    let pool_stats = pool.as_ref().map(|pool| pool.stats());
    cleanup_stop.trigger();
    if let Some(task) = cleanup {
        let _ = task.await;
    }
    if let Some(pool) = &pool {
        pool.shutdown().await;
    }

    Ok(LoadTestReport {
        clients,
        total_duration,
        pool: pool_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[test]
    fn test_sequence_stamp() {
        let mut chunk = build_chunk(1, 8);
        assert_eq!(&chunk[4..], &[5u8, 6, 7, 8]);

        stamp_sequence(&mut chunk, 7);
        assert_eq!(&chunk[..4], b"0007");
        stamp_sequence(&mut chunk, 12_345);
        assert_eq!(&chunk[..4], b"2345");

        let mut short = vec![0u8; 2];
        stamp_sequence(&mut short, 42);
        assert_eq!(short, b"00");
    }

    #[test]
    fn test_report_totals() {
        let client = |client, bytes| ClientStats {
            client,
            connected: true,
            sent_chunks: 2,
            bytes_sent: bytes,
            errors: client - 1,
            duration: Duration::from_secs(1),
        };
        let report = LoadTestReport {
            clients: vec![client(1, 2048), client(2, 2048)],
            total_duration: Duration::from_secs(2),
            pool: None,
        };
        assert_eq!(report.total_chunks(), 4);
        assert_eq!(report.total_errors(), 1);
        assert_eq!(report.throughput_kbps(), 2.0);
        assert_eq!(report.average_client_kbps(), 1.0);
        assert_eq!(report.clients[0].throughput_kbps(), 2.0);
        assert!(report.to_string().contains("total chunks:      4"));
    }

    /// Accepts WebSocket clients and counts binary frames
    async fn counting_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/audio", listener.local_addr().unwrap());
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_binary() {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        (url, received)
    }

    async fn load_test(url: &str, pooled: &str) -> LoadTestReport {
        let args = TuningArgs::parse_from([
            "tuning-client",
            "--server-url",
            url,
            "--client-count",
            "2",
            "--chunks-per-client",
            "3",
            "--chunk-interval-ms",
            "10",
            "--chunk-size",
            "64",
            "--use-connection-pool",
            pooled,
        ]);
        let shutdown = Shutdown::new();
        run_load_test(args, shutdown.subscribe()).await.unwrap()
    }

    async fn wait_for(received: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server should receive every chunk");
    }

    #[tokio::test]
    async fn test_pooled_run() {
        let (url, received) = counting_server().await;
        let report = load_test(&url, "true").await;

        assert_eq!(report.total_chunks(), 6);
        assert_eq!(report.total_bytes(), 6 * 64);
        assert_eq!(report.total_errors(), 0);
        let pool = report.pool.expect("pooled run reports pool stats");
        assert!(pool.created >= 1 && pool.created <= 2);
        assert_eq!(pool.active, 0);
        wait_for(&received, 6).await;
    }

    #[tokio::test]
    async fn test_direct_run() {
        let (url, received) = counting_server().await;
        let report = load_test(&url, "false").await;

        assert!(report.clients.iter().all(|c| c.connected));
        assert_eq!(report.total_chunks(), 6);
        assert!(report.pool.is_none());
        wait_for(&received, 6).await;
    }

    fn held_pool_args(url: &str) -> TuningArgs {
        TuningArgs::parse_from([
            "tuning-client",
            "--server-url",
            url,
            "--client-count",
            "2",
            "--chunks-per-client",
            "100000",
            "--chunk-interval-ms",
            "20",
            "--chunk-size",
            "64",
            "--test-duration-secs",
            "60",
            "--pool-size",
            "1",
        ])
    }

    #[tokio::test]
    async fn test_shutdown_releases_client_waiting_on_pool() {
        let (url, _) = counting_server().await;
        let shutdown = Shutdown::new();
        let run = tokio::spawn(run_load_test(held_pool_args(&url), shutdown.subscribe()));

        // client 1 holds the only connection, client 2 is parked in the pool
        tokio::time::sleep(Duration::from_millis(500)).await;
        let triggered = Instant::now();
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("run should stop well before the pool wait timeout")
            .unwrap()
            .unwrap();
        assert!(triggered.elapsed() < Duration::from_secs(3));
        assert_eq!(report.clients.len(), 2);
        assert_eq!(report.total_errors(), 0);
        assert!(report.clients[0].sent_chunks > 0);
        assert_eq!(report.pool.map(|pool| pool.waiting), Some(0));
    }

    #[tokio::test]
    async fn test_no_clients_start_after_shutdown() {
        let (url, received) = counting_server().await;
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let report = run_load_test(held_pool_args(&url), shutdown.subscribe())
            .await
            .unwrap();
        assert!(report.clients.is_empty());
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_counts_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/audio", listener.local_addr().unwrap());
        drop(listener);

        let report = load_test(&url, "false").await;
        assert!(report.clients.iter().all(|c| !c.connected));
        assert_eq!(report.total_errors(), 2);
        assert_eq!(report.total_chunks(), 0);
    }
}
