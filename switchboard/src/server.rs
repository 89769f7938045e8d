use std::net::SocketAddr;
use std::sync::Arc;
use std::{env, fs};

use anyhow::Result;
use ari::client::{AriClient, AriConfig};
use ari::events::EventSession;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::callflow::HttpActionSource;
use crate::channel::{CallSpec, CreateCall, HttpStatusCallback};
use crate::switchboard::Switchboard;

const DEFAULT_CONF: &str = "/etc/outcall/outcall.conf";

#[derive(Deserialize, Clone)]
pub struct Config {
    #[serde(flatten)]
    pub ari: AriConfig,
    #[serde(default = "default_listen")]
    pub http_listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8088))
}

impl Config {
    pub fn load() -> Result<Config> {
        let path = env::var("OUTCALL_CONF").unwrap_or_else(|_| DEFAULT_CONF.to_string());
        let contents = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

pub struct Server {
    config: Config,
    switchboard: Arc<Switchboard>,
    session: EventSession,
}

impl Server {
    pub fn new() -> Result<Server> {
        let config = Config::load()?;
        let control = Arc::new(AriClient::new(config.ari.clone()));
        let switchboard = Arc::new(Switchboard::new(
            control.clone(),
            Arc::new(HttpActionSource::new()),
            Arc::new(HttpStatusCallback::new()),
        ));
        let session = EventSession::new(&config.ari, control, switchboard.clone());
        Ok(Server {
            config,
            switchboard,
            session,
        })
    }

    pub async fn run(self) -> Result<()> {
        self.session.start().await;

        let app = Router::new()
            .route("/call", post(create_call))
            .route("/call/:id", delete(delete_call))
            .with_state(self.switchboard.clone());
        let listener = TcpListener::bind(&self.config.http_listen).await?;
        info!("listening on {}", self.config.http_listen);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        self.session.shutdown().await;
        Ok(())
    }
}

async fn create_call(
    State(switchboard): State<Arc<Switchboard>>,
    Json(call): Json<CreateCall>,
) -> Result<Json<CallSpec>, StatusCode> {
    match switchboard.create_call(call).await {
        Ok(spec) => Ok(Json(spec)),
        Err(e) => {
            warn!("create call failed: {e}");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn delete_call(
    State(switchboard): State<Arc<Switchboard>>,
    Path(id): Path<String>,
) -> StatusCode {
    if switchboard.delete_call(&id).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
