//! Shared bootstrap for integration tests: a full server on an ephemeral
//! port backed by an in-memory database.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use courier::api::{AppState, create_router};
use courier::auth::{AuthConfig, AuthState};
use courier::db::Database;
use courier::messaging::{MessagingRepository, MessagingService};
use courier::ws::{Hub, HubConfig, RelaySettings};

pub struct TestServer {
    pub addr: SocketAddr,
    auth: AuthState,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(RelaySettings::default()).await
    }

    pub async fn spawn_with(relay: RelaySettings) -> Self {
        let db = Database::in_memory().await.expect("in-memory database");
        let auth = AuthState::new(AuthConfig {
            jwt_secret: Some("integration-test-secret-at-least-32-chars".to_string()),
            system_token: Some("test-system-token".to_string()),
        })
        .expect("auth state");

        let service = Arc::new(MessagingService::new(
            MessagingRepository::new(db.pool().clone()),
            auth.clone(),
        ));

        let (hub, hub_handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let state = AppState::new(service, hub_handle, relay);
        let app = create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self { addr, auth }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn token_for(&self, user_id: &str) -> String {
        self.auth.encode_token(user_id, 3600).expect("token")
    }
}
