use std::time::Duration;

use tether::{
    ClientTransport, EstablisherConfig, HealthChecker, HealthCheckerConfig,
    ServerConfig, TransportServer,
};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let server = TransportServer::bind(
        ServerConfig::builder()
            .health(
                HealthCheckerConfig::builder()
                    .name("server-health")
                    .idle_time(Duration::from_secs(1))
                    .probe_interval(Duration::from_millis(250))
                    .build(),
            )
            .build(),
    )
    .await
    .unwrap();
    let addr = server.local_addr();

    let client = ClientTransport::new(
        vec![addr],
        EstablisherConfig::builder()
            .retry_interval(Duration::from_millis(100))
            .build(),
    );
    let checker = HealthChecker::start(
        HealthCheckerConfig::builder()
            .name("client-health")
            .idle_time(Duration::from_secs(1))
            .build(),
    );
    client.monitor_with(&checker);
    client.open().await.unwrap();
    println!("connected as {}", client.identity().unwrap());

    let accepted = server.accept().await.unwrap();
    client.send(b"ping".to_vec()).await.unwrap();
    let msg = accepted.recv().await.unwrap();
    println!("server got {:?}", String::from_utf8_lossy(&msg));
    accepted.send(b"pong".to_vec()).await.unwrap();
    let msg = client.recv().await.unwrap();
    println!("client got {:?}", String::from_utf8_lossy(&msg));

    // drop the socket and let the establisher restore it under the same
    // identity
    let epoch = client.transport().epoch();
    client.force_reconnect();
    client.send(b"after reconnect".to_vec()).await.unwrap();
    let msg = accepted.recv().await.unwrap();
    println!("server got {:?}", String::from_utf8_lossy(&msg));
    info!(
        "socket epoch {} -> {}, identity {}",
        epoch,
        client.transport().epoch(),
        client.identity().unwrap()
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    println!(
        "probes sent: client {}, server {}",
        checker.total_probes_sent(),
        server.health().map_or(0, |h| h.total_probes_sent())
    );

    client.close();
    checker.stop();
    server.shutdown();
}
