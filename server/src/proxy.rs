//! Remote-call proxy generation and routing
//!
//! The proxy component follows cluster membership. Whenever a server type is
//! seen for the first time it generates proxy records for it (one in the `sys`
//! namespace, one in the `user` namespace when the application ships remote
//! services for that type) and hands them to the RPC client. It also keeps the
//! live server list per type, which is what routing picks targets from.
//!
//! Routing tries, in order: a router registered for the message's server type,
//! the process-wide default router, and finally [`default_route`], which hashes
//! the session uid with crc32 so one user keeps landing on the same backend as
//! long as the server list does not change.

use crate::error::RouteError;
use crate::session::FrontendSession;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;

/// Descriptor of one backend (or frontend) process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: String,
    pub server_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub frontend: bool,
}

impl ServerInfo {
    pub fn new(id: &str, server_type: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            server_type: server_type.to_string(),
            host: host.to_string(),
            port,
            frontend: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Sys,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub namespace: Namespace,
    pub server_type: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    pub namespace: Namespace,
    pub server_type: String,
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Membership changes delivered by the cluster monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Add(Vec<ServerInfo>),
    Remove(Vec<String>),
    Replace(Vec<ServerInfo>),
}

/// The RPC transport this layer drives. Sending bytes is its business.
pub trait RpcClient: Send {
    fn add_proxies(&mut self, records: Vec<ProxyRecord>);

    fn clear_proxies(&mut self);

    fn add_servers(&mut self, servers: &[ServerInfo]);

    fn remove_servers(&mut self, ids: &[String]);

    fn replace_servers(&mut self, servers: &[ServerInfo]);

    fn rpc_invoke(
        &self,
        server_id: &str,
        msg: &RpcMessage,
    ) -> impl Future<Output = Result<Value, RouteError>> + Send;
}

/// Where remote service sources live on disk.
#[derive(Debug, Clone)]
pub struct RemotePaths {
    /// Root of the built-in remote services, holding `frontend/` and `backend/`
    pub sys_base: PathBuf,
    /// Application root, holding `app/servers/<type>/remote`
    pub app_base: PathBuf,
}

impl RemotePaths {
    pub fn sys_remote_path(&self, frontend: bool) -> Option<PathBuf> {
        let role = if frontend { "frontend" } else { "backend" };
        let path = self.sys_base.join(role);
        path.is_dir().then_some(path)
    }

    pub fn user_remote_path(&self, server_type: &str) -> Option<PathBuf> {
        let path = self
            .app_base
            .join("app")
            .join("servers")
            .join(server_type)
            .join("remote");
        path.is_dir().then_some(path)
    }

    pub fn records_for(&self, info: &ServerInfo) -> Vec<ProxyRecord> {
        let mut records = Vec::new();

        if let Some(path) = self.sys_remote_path(info.frontend) {
            records.push(ProxyRecord {
                namespace: Namespace::Sys,
                server_type: info.server_type.clone(),
                path,
            });
        }

        if let Some(path) = self.user_remote_path(&info.server_type) {
            records.push(ProxyRecord {
                namespace: Namespace::User,
                server_type: info.server_type.clone(),
                path,
            });
        }

        records
    }
}

/// Live servers grouped by type, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct ServerRegistry {
    by_type: HashMap<String, Vec<ServerInfo>>,
}

impl ServerRegistry {
    pub fn add(&mut self, servers: &[ServerInfo]) {
        for server in servers {
            let list = self.by_type.entry(server.server_type.clone()).or_default();
            match list.iter_mut().find(|s| s.id == server.id) {
                Some(existing) => *existing = server.clone(),
                None => list.push(server.clone()),
            }
        }
    }

    pub fn remove(&mut self, ids: &[String]) {
        for list in self.by_type.values_mut() {
            list.retain(|s| !ids.contains(&s.id));
        }
        self.by_type.retain(|_, list| !list.is_empty());
    }

    pub fn replace(&mut self, servers: &[ServerInfo]) {
        self.by_type.clear();
        self.add(servers);
    }

    pub fn servers_by_type(&self, server_type: &str) -> &[ServerInfo] {
        self.by_type
            .get(server_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, id: &str) -> Option<&ServerInfo> {
        self.by_type.values().flatten().find(|s| s.id == id)
    }
}

pub type Router = Box<
    dyn Fn(Option<&FrontendSession>, &RpcMessage, &ServerRegistry) -> Result<String, RouteError>
        + Send
        + Sync,
>;

/// Picks a target by crc32 of the uid (empty when unbound) modulo the
/// number of live servers of the message's type.
pub fn default_route(
    session: Option<&FrontendSession>,
    msg: &RpcMessage,
    registry: &ServerRegistry,
) -> Result<String, RouteError> {
    let list = registry.servers_by_type(&msg.server_type);
    if list.is_empty() {
        return Err(RouteError::NoServerAvailable(msg.server_type.clone()));
    }

    let uid = session.and_then(|s| s.uid.as_deref()).unwrap_or("");
    let index = uid_slot(uid, list.len());
    Ok(list[index].id.clone())
}

/// Slot of `uid` among `len` servers: the checksum read as a signed 32-bit
/// value, made absolute.
pub fn uid_slot(uid: &str, len: usize) -> usize {
    (crc32fast::hash(uid.as_bytes()) as i32).unsigned_abs() as usize % len
}

pub struct ProxyComponent<C: RpcClient> {
    client: C,
    paths: RemotePaths,
    proxied: HashSet<String>,
    registry: ServerRegistry,
    routes: HashMap<String, Router>,
    default_router: Option<Router>,
}

impl<C: RpcClient> ProxyComponent<C> {
    pub fn new(client: C, paths: RemotePaths) -> Self {
        Self {
            client,
            paths,
            proxied: HashSet::new(),
            registry: ServerRegistry::default(),
            routes: HashMap::new(),
            default_router: None,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn has_proxy(&self, server_type: &str) -> bool {
        self.proxied.contains(server_type)
    }

    /// Overrides routing for one server type.
    pub fn set_route(&mut self, server_type: impl Into<String>, router: Router) {
        self.routes.insert(server_type.into(), router);
    }

    /// Overrides routing for every type without its own router.
    pub fn set_default_route(&mut self, router: Router) {
        self.default_router = Some(router);
    }

    pub fn handle(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Add(servers) => self.add_servers(&servers),
            MembershipEvent::Remove(ids) => self.remove_servers(&ids),
            MembershipEvent::Replace(servers) => self.replace_servers(&servers),
        }
    }

    pub fn add_servers(&mut self, servers: &[ServerInfo]) {
        if servers.is_empty() {
            return;
        }

        self.gen_proxies(servers);
        self.registry.add(servers);
        self.client.add_servers(servers);
    }

    pub fn remove_servers(&mut self, ids: &[String]) {
        info!("Removing servers {:?}", ids);
        self.registry.remove(ids);
        self.client.remove_servers(ids);
    }

    /// Full membership refresh from a topology snapshot.
    pub fn replace_servers(&mut self, servers: &[ServerInfo]) {
        if servers.is_empty() {
            return;
        }

        self.proxied.clear();
        self.client.clear_proxies();
        self.gen_proxies(servers);
        self.registry.replace(servers);
        self.client.replace_servers(servers);
    }

    fn gen_proxies(&mut self, servers: &[ServerInfo]) {
        for info in servers {
            if self.proxied.contains(&info.server_type) {
                continue;
            }

            let records = self.paths.records_for(info);
            if records.is_empty() {
                warn!("No remote service paths found for type {}", info.server_type);
            }
            debug!(
                "Generated {} proxy records for type {}",
                records.len(),
                info.server_type
            );
            self.proxied.insert(info.server_type.clone());
            self.client.add_proxies(records);
        }
    }

    pub fn route(
        &self,
        session: Option<&FrontendSession>,
        msg: &RpcMessage,
    ) -> Result<String, RouteError> {
        let router = self
            .routes
            .get(&msg.server_type)
            .or(self.default_router.as_ref());

        match router {
            Some(router) => router(session, msg, &self.registry),
            None => default_route(session, msg, &self.registry),
        }
    }

    pub async fn rpc_invoke(&self, server_id: &str, msg: &RpcMessage) -> Result<Value, RouteError> {
        self.client.rpc_invoke(server_id, msg).await
    }

    /// Routes `msg` for `session` and invokes it on the chosen server.
    pub async fn invoke(
        &self,
        session: Option<&FrontendSession>,
        msg: &RpcMessage,
    ) -> Result<Value, RouteError> {
        let server_id = self.route(session, msg)?;
        self.rpc_invoke(&server_id, msg).await
    }
}
