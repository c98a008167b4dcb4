//! Push schedulers
//!
//! A push is a server-initiated message to a set of sessions. Schedulers decide
//! when it hits the wire:
//! - `direct` sends immediately, one transport write per receiver
//! - `buffer` queues per session and flushes each queue as one batch on the
//!   frontend's flush tick
//!
//! A [`MultiPushScheduler`] holds several of them under numeric ids and lets a
//! caller-supplied selector pick one per push.

use crate::error::ScheduleError;
use crate::session::SessionId;
use crate::session_service::SessionService;
use log::{debug, error, info};
use relay_shared::{encode, Envelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOptions {
    /// Push to every session instead of `receivers`
    #[serde(default)]
    pub broadcast: bool,
    /// With `broadcast`, skip sessions that have no uid
    #[serde(default)]
    pub bound_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    /// Id of the request that triggered the push, 0 when server initiated
    pub req_id: u32,
    pub route: String,
    pub msg: Value,
    pub receivers: Vec<SessionId>,
    pub opts: PushOptions,
}

impl PushRequest {
    pub fn to(receivers: Vec<SessionId>, route: &str, msg: Value) -> Self {
        Self {
            req_id: 0,
            route: route.to_string(),
            msg,
            receivers,
            opts: PushOptions::default(),
        }
    }

    pub fn broadcast(route: &str, msg: Value, bound_only: bool) -> Self {
        Self {
            req_id: 0,
            route: route.to_string(),
            msg,
            receivers: Vec::new(),
            opts: PushOptions {
                broadcast: true,
                bound_only,
            },
        }
    }

    fn envelope(&self) -> Envelope {
        encode(None, &self.route, self.msg.clone())
    }

    fn targets(&self, service: &SessionService) -> Vec<SessionId> {
        if !self.opts.broadcast {
            return self.receivers.clone();
        }
        if self.opts.bound_only {
            service.bound_session_ids()
        } else {
            service.session_ids()
        }
    }
}

/// Configured shape of one sub-scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchedulerKind {
    Direct,
    Buffer { flush_interval_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerConfig {
    Single(SchedulerKind),
    Multi(BTreeMap<u32, SchedulerKind>),
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Single(SchedulerKind::Direct)
    }
}

#[derive(Debug, Default)]
pub struct DirectScheduler;

impl DirectScheduler {
    pub fn schedule(&mut self, service: &mut SessionService, req: &PushRequest) {
        let envelope = req.envelope();
        for sid in req.targets(service) {
            service.send_message(sid, &envelope);
        }
    }
}

#[derive(Debug)]
pub struct BufferScheduler {
    flush_interval: Duration,
    queues: HashMap<SessionId, Vec<Envelope>>,
    running: bool,
}

impl BufferScheduler {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            queues: HashMap::new(),
            running: false,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn schedule(&mut self, service: &SessionService, req: &PushRequest) {
        let envelope = req.envelope();
        for sid in req.targets(service) {
            if service.get(sid).is_none() {
                debug!("Dropping buffered push for non-existing session, sid: {}", sid);
                continue;
            }
            self.queues.entry(sid).or_default().push(envelope.clone());
        }
    }

    /// Sends every queued envelope, one batch per session.
    pub fn flush(&mut self, service: &mut SessionService) {
        for (sid, queue) in self.queues.drain() {
            service.send_batch(sid, &queue);
        }
    }

    pub fn start(&mut self) -> Result<(), ScheduleError> {
        if self.flush_interval.is_zero() {
            return Err(ScheduleError::Lifecycle {
                name: "buffer",
                action: "start",
                reason: "flush interval must be positive".to_string(),
            });
        }
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self, service: &mut SessionService) -> Result<(), ScheduleError> {
        self.flush(service);
        self.running = false;
        Ok(())
    }
}

#[derive(Debug)]
pub enum Scheduler {
    Direct(DirectScheduler),
    Buffered(BufferScheduler),
}

impl Scheduler {
    pub fn from_kind(kind: &SchedulerKind) -> Self {
        match kind {
            SchedulerKind::Direct => Scheduler::Direct(DirectScheduler),
            SchedulerKind::Buffer { flush_interval_ms } => Scheduler::Buffered(
                BufferScheduler::new(Duration::from_millis(*flush_interval_ms)),
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scheduler::Direct(_) => "direct",
            Scheduler::Buffered(_) => "buffer",
        }
    }

    pub fn schedule(&mut self, service: &mut SessionService, req: &PushRequest) {
        match self {
            Scheduler::Direct(s) => s.schedule(service, req),
            Scheduler::Buffered(s) => s.schedule(service, req),
        }
    }

    pub fn flush(&mut self, service: &mut SessionService) {
        if let Scheduler::Buffered(s) = self {
            s.flush(service);
        }
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        match self {
            Scheduler::Direct(_) => None,
            Scheduler::Buffered(s) => Some(s.flush_interval()),
        }
    }

    pub fn start(&mut self) -> Result<(), ScheduleError> {
        match self {
            Scheduler::Direct(_) => Ok(()),
            Scheduler::Buffered(s) => s.start(),
        }
    }

    pub fn stop(&mut self, service: &mut SessionService) -> Result<(), ScheduleError> {
        match self {
            Scheduler::Direct(_) => Ok(()),
            Scheduler::Buffered(s) => s.stop(service),
        }
    }
}

pub type Selector = Box<dyn Fn(&PushRequest) -> u32 + Send + Sync>;

pub struct MultiPushScheduler {
    schedulers: BTreeMap<u32, Scheduler>,
    selector: Selector,
}

impl MultiPushScheduler {
    pub fn new(schedulers: BTreeMap<u32, Scheduler>, selector: Selector) -> Self {
        Self {
            schedulers,
            selector,
        }
    }

    pub fn get(&self, id: u32) -> Option<&Scheduler> {
        self.schedulers.get(&id)
    }

    /// Asks the selector once and delegates. An unregistered id drops the
    /// push and is reported, never panics.
    pub fn schedule(
        &mut self,
        service: &mut SessionService,
        req: &PushRequest,
    ) -> Result<(), ScheduleError> {
        let id = (self.selector)(req);
        match self.schedulers.get_mut(&id) {
            Some(scheduler) => {
                scheduler.schedule(service, req);
                Ok(())
            }
            None => {
                error!("invalid pushScheduler id, id: {}", id);
                Err(ScheduleError::SchedulerNotFound(id))
            }
        }
    }

    pub fn flush(&mut self, service: &mut SessionService) {
        for scheduler in self.schedulers.values_mut() {
            scheduler.flush(service);
        }
    }

    /// Shortest flush interval among the buffered sub-schedulers.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.schedulers
            .values()
            .filter_map(Scheduler::flush_interval)
            .min()
    }

    pub fn start(&mut self) -> Result<(), ScheduleError> {
        for scheduler in self.schedulers.values_mut() {
            scheduler.start()?;
        }
        Ok(())
    }

    pub fn stop(&mut self, service: &mut SessionService) -> Result<(), ScheduleError> {
        for scheduler in self.schedulers.values_mut() {
            scheduler.stop(service)?;
        }
        Ok(())
    }
}

/// The scheduler a frontend pushes through.
pub enum PushScheduler {
    Single(Scheduler),
    Multi(MultiPushScheduler),
}

impl PushScheduler {
    pub fn from_config(
        config: &SchedulerConfig,
        selector: Option<Selector>,
    ) -> Result<Self, ScheduleError> {
        match config {
            SchedulerConfig::Single(kind) => Ok(PushScheduler::Single(Scheduler::from_kind(kind))),
            SchedulerConfig::Multi(kinds) => {
                let selector = selector.ok_or(ScheduleError::MissingSelector)?;
                let schedulers = kinds
                    .iter()
                    .map(|(id, kind)| (*id, Scheduler::from_kind(kind)))
                    .collect();
                Ok(PushScheduler::Multi(MultiPushScheduler::new(
                    schedulers, selector,
                )))
            }
        }
    }

    pub fn schedule(
        &mut self,
        service: &mut SessionService,
        req: &PushRequest,
    ) -> Result<(), ScheduleError> {
        match self {
            PushScheduler::Single(s) => {
                s.schedule(service, req);
                Ok(())
            }
            PushScheduler::Multi(m) => m.schedule(service, req),
        }
    }

    pub fn flush(&mut self, service: &mut SessionService) {
        match self {
            PushScheduler::Single(s) => s.flush(service),
            PushScheduler::Multi(m) => m.flush(service),
        }
    }

    /// How often the owner should call `flush`, `None` when nothing buffers.
    pub fn flush_interval(&self) -> Option<Duration> {
        match self {
            PushScheduler::Single(s) => s.flush_interval(),
            PushScheduler::Multi(m) => m.flush_interval(),
        }
    }

    pub fn start(&mut self) -> Result<(), ScheduleError> {
        info!("Starting push scheduler");
        match self {
            PushScheduler::Single(s) => s.start(),
            PushScheduler::Multi(m) => m.start(),
        }
    }

    pub fn stop(&mut self, service: &mut SessionService) -> Result<(), ScheduleError> {
        info!("Stopping push scheduler");
        match self {
            PushScheduler::Single(s) => s.stop(service),
            PushScheduler::Multi(m) => m.stop(service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::MockTransport;
    use crate::connector::Socket;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn service_with(sids: &[SessionId]) -> (SessionService, HashMap<SessionId, MockTransport>) {
        let mut service = SessionService::new("connector-1", false);
        let mut transports = HashMap::new();
        for sid in sids {
            let transport = MockTransport::default();
            service
                .create(Socket::stream(*sid, Box::new(transport.clone())))
                .unwrap();
            transports.insert(*sid, transport);
        }
        (service, transports)
    }

    fn sent_json(transport: &MockTransport) -> Vec<Value> {
        transport
            .sent()
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_direct_to_receivers() {
        let (mut service, transports) = service_with(&[1, 2, 3]);
        let mut scheduler = Scheduler::from_kind(&SchedulerKind::Direct);

        scheduler.schedule(&mut service, &PushRequest::to(vec![1, 3, 99], "onChat", json!("hi")));

        assert_eq!(sent_json(&transports[&1]), vec![json!({"route": "onChat", "body": "hi"})]);
        assert!(transports[&2].sent().is_empty());
        assert_eq!(transports[&3].sent().len(), 1);
    }

    #[test]
    fn test_direct_broadcast_bound_only() {
        let (mut service, transports) = service_with(&[1, 2]);
        service.bind(2, "bob").unwrap();
        let mut scheduler = DirectScheduler;

        scheduler.schedule(&mut service, &PushRequest::broadcast("onNews", json!(1), true));
        assert!(transports[&1].sent().is_empty());
        assert_eq!(transports[&2].sent().len(), 1);

        scheduler.schedule(&mut service, &PushRequest::broadcast("onNews", json!(2), false));
        assert_eq!(transports[&1].sent().len(), 1);
        assert_eq!(transports[&2].sent().len(), 2);
    }

    #[test]
    fn test_buffer_batches_until_flush() {
        let (mut service, transports) = service_with(&[1]);
        let mut scheduler = BufferScheduler::new(Duration::from_millis(20));
        scheduler.start().unwrap();

        scheduler.schedule(&service, &PushRequest::to(vec![1, 5], "onA", json!(1)));
        scheduler.schedule(&service, &PushRequest::to(vec![1], "onB", json!(2)));
        assert_eq!(scheduler.pending(), 2);
        assert!(transports[&1].sent().is_empty());

        scheduler.flush(&mut service);
        let sent = sent_json(&transports[&1]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0]["route"], "onA");
        assert_eq!(sent[0][1]["route"], "onB");
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_buffer_lifecycle() {
        let (mut service, transports) = service_with(&[1]);
        let mut broken = BufferScheduler::new(Duration::ZERO);
        assert!(matches!(
            broken.start(),
            Err(ScheduleError::Lifecycle { name: "buffer", .. })
        ));

        let mut scheduler = BufferScheduler::new(Duration::from_millis(5));
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        scheduler.schedule(&service, &PushRequest::to(vec![1], "onA", json!(1)));
        scheduler.stop(&mut service).unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(transports[&1].sent().len(), 1);
    }

    fn counting_multi(target: u32) -> (MultiPushScheduler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut schedulers = BTreeMap::new();
        schedulers.insert(0, Scheduler::from_kind(&SchedulerKind::Direct));
        schedulers.insert(
            1,
            Scheduler::from_kind(&SchedulerKind::Buffer {
                flush_interval_ms: 10,
            }),
        );
        let selector: Selector = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            target
        });
        (MultiPushScheduler::new(schedulers, selector), calls)
    }

    #[test]
    fn test_multi_delegates_to_selected() {
        let (mut service, transports) = service_with(&[1]);
        let (mut multi, calls) = counting_multi(1);

        multi
            .schedule(&mut service, &PushRequest::to(vec![1], "onA", json!(1)))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(transports[&1].sent().is_empty());
        match multi.get(1) {
            Some(Scheduler::Buffered(buffer)) => assert_eq!(buffer.pending(), 1),
            other => panic!("unexpected scheduler: {:?}", other),
        }

        multi.flush(&mut service);
        assert_eq!(transports[&1].sent().len(), 1);
    }

    #[test]
    fn test_multi_unknown_id_drops() {
        let (mut service, transports) = service_with(&[1]);
        let (mut multi, calls) = counting_multi(7);

        let result = multi.schedule(&mut service, &PushRequest::to(vec![1], "onA", json!(1)));
        assert_eq!(result, Err(ScheduleError::SchedulerNotFound(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        multi.flush(&mut service);
        assert!(transports[&1].sent().is_empty());
    }

    #[test]
    fn test_multi_start_propagates_first_failure() {
        let (mut service, _) = service_with(&[]);
        let mut schedulers = BTreeMap::new();
        schedulers.insert(0, Scheduler::Direct(DirectScheduler));
        schedulers.insert(1, Scheduler::Buffered(BufferScheduler::new(Duration::ZERO)));
        schedulers.insert(2, Scheduler::Buffered(BufferScheduler::new(Duration::from_millis(1))));
        let mut multi = MultiPushScheduler::new(schedulers, Box::new(|_| 0));

        assert!(multi.start().is_err());
        match multi.get(2) {
            Some(Scheduler::Buffered(buffer)) => assert!(!buffer.is_running()),
            other => panic!("unexpected scheduler: {:?}", other),
        }
        assert!(multi.stop(&mut service).is_ok());
    }

    #[test]
    fn test_config_builds_tagged_variants() {
        let config: SchedulerConfig = serde_json::from_value(json!({
            "multi": {
                "0": {"type": "direct"},
                "1": {"type": "buffer", "flush_interval_ms": 50}
            }
        }))
        .unwrap();

        assert!(matches!(
            PushScheduler::from_config(&config, None),
            Err(ScheduleError::MissingSelector)
        ));

        let scheduler = PushScheduler::from_config(&config, Some(Box::new(|_| 0))).unwrap();
        match scheduler {
            PushScheduler::Multi(ref multi) => {
                assert_eq!(multi.get(0).map(Scheduler::name), Some("direct"));
                assert_eq!(multi.get(1).map(Scheduler::name), Some("buffer"));
            }
            PushScheduler::Single(_) => panic!("expected multi scheduler"),
        }

        assert_eq!(scheduler.flush_interval(), Some(Duration::from_millis(50)));

        let single = PushScheduler::from_config(&SchedulerConfig::default(), None).unwrap();
        assert!(matches!(single, PushScheduler::Single(Scheduler::Direct(_))));
        assert_eq!(single.flush_interval(), None);
    }
}
