use clap::Parser;
use log::{error, info};
use relay_server::config::{FrontendConfig, HeartbeatConfig};
use relay_server::error::{HandlerError, RouteError};
use relay_server::network::{FrontendServer, Handler, RequestContext, ServerResult};
use relay_server::proxy::{
    MembershipEvent, Namespace, ProxyComponent, ProxyRecord, RemotePaths, RpcClient, RpcMessage,
    ServerInfo,
};
use relay_server::scheduler::{PushRequest, PushScheduler, SchedulerConfig, SchedulerKind};
use relay_shared::Message;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "3010")]
    port: u16,
    /// Identifier stamped on every session of this frontend
    #[clap(long, default_value = "connector-server-1")]
    frontend_id: String,
    /// Allow at most one session per uid
    #[clap(long)]
    single_session: bool,
    #[clap(long, default_value = "1024")]
    max_sessions: usize,
    /// Heartbeat interval in seconds, 0 disables heartbeats
    #[clap(long, default_value = "25")]
    heartbeat_interval: u64,
    /// Heartbeat timeout in seconds
    #[clap(long, default_value = "60")]
    heartbeat_timeout: u64,
    /// Serial filter timeout in milliseconds
    #[clap(long, default_value = "3000")]
    serial_timeout_ms: u64,
    /// Buffer pushes and flush them every N milliseconds, 0 pushes directly
    #[clap(long, default_value = "0")]
    buffer_ms: u64,
    /// Chat backend ids requests are routed to
    #[clap(long, value_delimiter = ',', default_value = "chat-server-1,chat-server-2")]
    chat_servers: Vec<String>,
    /// Application root holding `app/servers/<type>/remote`
    #[clap(long, default_value = ".")]
    base_dir: PathBuf,
}

impl Args {
    fn to_config(&self) -> Result<FrontendConfig, std::net::AddrParseError> {
        let bind: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        let defaults = FrontendConfig::default();
        Ok(FrontendConfig {
            frontend_id: self.frontend_id.clone(),
            bind,
            single_session: self.single_session,
            max_sessions: self.max_sessions,
            serial_timeout: Duration::from_millis(self.serial_timeout_ms),
            flush_interval: match self.buffer_ms {
                0 => defaults.flush_interval,
                ms => Duration::from_millis(ms),
            },
            heartbeat: HeartbeatConfig {
                enabled: self.heartbeat_interval > 0,
                interval: Duration::from_secs(self.heartbeat_interval),
                timeout: Duration::from_secs(self.heartbeat_timeout),
                ..HeartbeatConfig::default()
            },
            ..defaults
        })
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        match self.buffer_ms {
            0 => SchedulerConfig::Single(SchedulerKind::Direct),
            ms => SchedulerConfig::Single(SchedulerKind::Buffer {
                flush_interval_ms: ms,
            }),
        }
    }
}

/// Stands in for the cluster RPC transport: every call is answered locally.
#[derive(Debug, Default)]
struct LoopbackRpc {
    records: Vec<ProxyRecord>,
    servers: Vec<String>,
}

impl RpcClient for LoopbackRpc {
    fn add_proxies(&mut self, records: Vec<ProxyRecord>) {
        self.records.extend(records);
    }

    fn clear_proxies(&mut self) {
        self.records.clear();
    }

    fn add_servers(&mut self, servers: &[ServerInfo]) {
        self.servers.extend(servers.iter().map(|s| s.id.clone()));
    }

    fn remove_servers(&mut self, ids: &[String]) {
        self.servers.retain(|id| !ids.contains(id));
    }

    fn replace_servers(&mut self, servers: &[ServerInfo]) {
        self.servers = servers.iter().map(|s| s.id.clone()).collect();
    }

    async fn rpc_invoke(&self, server_id: &str, msg: &RpcMessage) -> Result<Value, RouteError> {
        if !self.servers.iter().any(|id| id == server_id) {
            return Err(RouteError::Rpc {
                server_id: server_id.to_string(),
                reason: "unknown server".to_string(),
            });
        }
        Ok(json!({
            "server": server_id,
            "service": msg.service,
            "method": msg.method,
            "args": msg.args,
        }))
    }
}

struct ChatHandler {
    proxy: ProxyComponent<LoopbackRpc>,
}

impl ChatHandler {
    fn uid(ctx: &RequestContext) -> Result<String, HandlerError> {
        ctx.session
            .uid
            .clone()
            .ok_or_else(|| HandlerError::Rejected("session is not logged in".to_string()))
    }
}

impl Handler for ChatHandler {
    async fn handle(&self, ctx: RequestContext, msg: Message) -> Result<Value, HandlerError> {
        let sid = ctx.session.id;

        match msg.route.as_str() {
            "connector.entry" => {
                let uid = msg.body["uid"]
                    .as_str()
                    .ok_or_else(|| HandlerError::Rejected("missing uid".to_string()))?;
                ctx.frontend.bind(sid, uid).await?;
                ctx.frontend.import(sid, "login_at", json!(msg.id)).await?;
                Ok(json!({ "code": 200, "uid": uid }))
            }
            "connector.echo" => Ok(msg.body),
            "connector.logout" => {
                ctx.frontend.kick_session(sid, "logout").await?;
                Ok(json!({ "code": 200 }))
            }
            "chat.send" => {
                let uid = Self::uid(&ctx)?;
                let call = RpcMessage {
                    namespace: Namespace::User,
                    server_type: "chat".to_string(),
                    service: "chatRemote".to_string(),
                    method: "send".to_string(),
                    args: vec![json!(uid), msg.body.clone()],
                };
                let reply = self.proxy.invoke(Some(&ctx.session), &call).await?;

                let push = PushRequest::broadcast(
                    "onChat",
                    json!({ "from": uid, "content": msg.body, "server": reply["server"] }),
                    true,
                );
                ctx.frontend.push(push).await?;
                Ok(json!({ "code": 200, "server": reply["server"] }))
            }
            _ => Err(HandlerError::UnknownRoute(msg.route)),
        }
    }
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    env_logger::init();

    // Parse command line arguments
    let args = Args::parse();
    let config = args.to_config()?;
    let scheduler = PushScheduler::from_config(&args.scheduler_config(), None)?;

    let mut proxy = ProxyComponent::new(
        LoopbackRpc::default(),
        RemotePaths {
            sys_base: args.base_dir.join("sys"),
            app_base: args.base_dir.clone(),
        },
    );
    let chat_servers = args
        .chat_servers
        .iter()
        .enumerate()
        .map(|(i, id)| ServerInfo::new(id, "chat", &args.host, 6050 + i as u16))
        .collect();
    proxy.handle(MembershipEvent::Add(chat_servers));
    info!(
        "Routing chat to {} servers",
        proxy.registry().servers_by_type("chat").len()
    );

    let mut server = FrontendServer::new(config, ChatHandler { proxy }, scheduler).await?;

    // Handle shutdown gracefully
    let handle = server.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                handle.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await
}
