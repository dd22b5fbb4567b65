//! Routing of received messages to handlers, and sharing of listeners between routes.
//!
//! A [`HandlerRegistry`] maps MSH-9 values to handlers. Lookups take a read lock, so
//! connections never wait on each other while dispatching. A [`ListenerRegistry`]
//! owns at most one listener per port; every route registered for that port is added
//! to the listener's handler table, and the listener is stopped when its last route
//! goes away.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock},
};

use log::{debug, info};

use crate::config::MllpConfig;

use super::{
    error::MllpError,
    exchange::{Exchange, HandlerError, MessageHandler},
    server::{MllpServer, ServerHandle},
};

/// Route matching any message without a more specific route.
pub const DEFAULT_ROUTE: &str = "*";

#[derive(Default)]
pub struct HandlerRegistry {
    routes: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages whose MSH-9 matches `route` to `handler`.
    ///
    /// `route` is either a full message type (`ADT^A01`), an event type (`ADT`) or
    /// [`DEFAULT_ROUTE`]. Returns the handler previously registered for it.
    pub fn register(
        &self,
        route: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(route.into(), handler)
    }

    pub fn register_fn<F>(&self, route: impl Into<String>, handler: F)
    where
        F: Fn(&mut Exchange) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(route, Arc::new(handler));
    }

    pub fn deregister(&self, route: &str) -> Option<Arc<dyn MessageHandler>> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(route)
    }

    /// Most specific handler for a message: full type, then event type, then default.
    pub fn lookup(
        &self,
        message_type: Option<&str>,
        event_type: Option<&str>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);

        [message_type, event_type, Some(DEFAULT_ROUTE)]
            .into_iter()
            .flatten()
            .find_map(|route| routes.get(route))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<_> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        routes.sort();
        routes
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.routes())
            .finish()
    }
}

struct Listener {
    handlers: Arc<HandlerRegistry>,
    server: ServerHandle,
}

#[derive(Default)]
struct Listeners {
    active: HashMap<u16, Listener>,
    /// Ports whose listener is being bound outside the lock.
    binding: HashSet<u16>,
}

/// One listener per port, shared by every route registered on that port.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Listeners>,
    bound: Condvar,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `route` to the listener on `config.port`, starting the listener if the
    /// port has none yet. Port 0 always starts a new listener on an ephemeral port.
    ///
    /// The configuration of the first registration on a port is the one its
    /// listener runs with. Binding happens outside the registry lock and may take
    /// up to `bind_timeout`; registrations for the same port wait for it, all others
    /// proceed.
    pub fn register(
        &self,
        config: &MllpConfig,
        route: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SocketAddr, MllpError> {
        let port = config.port;
        let mut listeners = self.lock();

        if port != 0 {
            while listeners.binding.contains(&port) {
                listeners = self
                    .bound
                    .wait(listeners)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if let Some(listener) = listeners.active.get(&port) {
                debug!("adding route '{route}' to listener on port {port}");
                listener.handlers.register(route, handler);
                return Ok(listener.server.local_addr());
            }
            listeners.binding.insert(port);
        }
        drop(listeners);

        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(route, handler);
        let bound = MllpServer::new(config.clone(), Arc::clone(&handlers)).bind();

        let mut listeners = self.lock();
        listeners.binding.remove(&port);
        self.bound.notify_all();

        let server = bound?;
        let address = server.local_addr();
        listeners.active.insert(address.port(), Listener { handlers, server });
        Ok(address)
    }

    /// Removes `route` from the listener on `port`; the listener stops with its last
    /// route. Returns whether the route existed.
    pub fn deregister(&self, port: u16, route: &str) -> bool {
        let stopped = {
            let mut listeners = self.lock();
            let Some(listener) = listeners.active.get(&port) else {
                return false;
            };
            if listener.handlers.deregister(route).is_none() {
                return false;
            }
            if !listener.handlers.is_empty() {
                return true;
            }
            listeners.active.remove(&port)
        };

        if let Some(listener) = stopped {
            info!("last route removed from port {port}");
            listener.server.shutdown();
        }
        true
    }

    /// Ports with a running listener.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<_> = self.lock().active.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn handlers(&self, port: u16) -> Option<Arc<HandlerRegistry>> {
        self.lock()
            .active
            .get(&port)
            .map(|listener| Arc::clone(&listener.handlers))
    }

    pub fn shutdown_all(&self) {
        let listeners: Vec<_> = self
            .lock()
            .active
            .drain()
            .map(|(_, listener)| listener)
            .collect();

        for listener in listeners {
            listener.server.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::protocol::{
        AckCode, Outcome, ack,
        frame::{self, Decoded, FrameDecoder},
        testing::{message, test_config},
    };

    fn tagged(tag: &'static str) -> Arc<dyn MessageHandler> {
        Arc::new(move |exchange: &mut Exchange| -> Result<(), HandlerError> {
            exchange.acknowledge(AckCode::ApplicationAccept, Some(tag));
            Ok(())
        })
    }

    fn tag_of(handler: Option<Arc<dyn MessageHandler>>) -> Option<String> {
        let mut exchange = Exchange::new(message("1"), Default::default(), Default::default());
        handler?.handle(&mut exchange).unwrap();
        exchange.ack_text().map(str::to_string)
    }

    #[test]
    fn lookup_prefers_most_specific_route() {
        let registry = HandlerRegistry::new();
        registry.register("ADT^A01", tagged("exact"));
        registry.register("ADT", tagged("event"));
        registry.register(DEFAULT_ROUTE, tagged("default"));

        assert_eq!(tag_of(registry.lookup(Some("ADT^A01"), Some("ADT"))), Some("exact".into()));
        assert_eq!(tag_of(registry.lookup(Some("ADT^A04"), Some("ADT"))), Some("event".into()));
        assert_eq!(tag_of(registry.lookup(Some("ORU^R01"), Some("ORU"))), Some("default".into()));
        assert_eq!(tag_of(registry.lookup(None, None)), Some("default".into()));
    }

    #[test]
    fn deregister_routes() {
        let registry = HandlerRegistry::new();
        registry.register("ADT", tagged("event"));
        assert_eq!(registry.routes(), vec!["ADT".to_string()]);

        assert!(registry.deregister("ADT").is_some());
        assert!(registry.deregister("ADT").is_none());
        assert!(registry.is_empty());
        assert!(registry.lookup(Some("ADT^A01"), Some("ADT")).is_none());
    }

    fn send(address: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        std::io::Write::write_all(&mut stream, &frame::encode(payload)).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = [0; 1024];
        loop {
            let n = std::io::Read::read(&mut stream, &mut buf).unwrap();
            assert!(n > 0);
            if let Decoded::Complete(ack) = decoder.feed(&buf[..n]) {
                return ack;
            }
        }
    }

    #[test]
    fn routes_share_one_listener() {
        let registry = ListenerRegistry::new();
        let address = registry
            .register(&test_config(), "ADT", tagged("adt"))
            .unwrap();

        let config = MllpConfig {
            port: address.port(),
            ..test_config()
        };
        let second = registry.register(&config, "ORU", tagged("oru")).unwrap();
        assert_eq!(second, address);
        assert_eq!(registry.ports(), vec![address.port()]);
        assert_eq!(registry.handlers(address.port()).unwrap().len(), 2);

        let ack = send(address, &message("42"));
        assert_eq!(ack::classify(&ack), Outcome::Accept);
        assert!(ack.ends_with(b"MSA|AA|42|adt\r"));

        assert!(registry.deregister(address.port(), "ADT"));
        assert!(!registry.deregister(address.port(), "ADT"));
        assert_eq!(registry.ports(), vec![address.port()]);

        // The remaining route rejects what it does not handle.
        let ack = send(address, &message("43"));
        assert_eq!(ack::classify(&ack), Outcome::ApplicationReject);

        assert!(registry.deregister(address.port(), "ORU"));
        assert!(registry.ports().is_empty());
        assert!(TcpStream::connect(address).is_err());
    }

    #[test]
    fn slow_bind_does_not_block_other_ports() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = Arc::new(ListenerRegistry::new());
        let config = MllpConfig {
            port: taken.local_addr().unwrap().port(),
            bind_timeout: Duration::from_millis(800),
            bind_retry_interval: Duration::from_millis(50),
            ..test_config()
        };
        let slow = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.register(&config, "*", tagged("slow")))
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        let address = registry.register(&test_config(), "*", tagged("fast")).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(registry.ports(), vec![address.port()]);

        assert!(matches!(slow.join().unwrap(), Err(MllpError::Bind { .. })));
        assert_eq!(registry.ports(), vec![address.port()]);
    }

    #[test]
    fn registrations_racing_for_a_port_share_its_listener() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let registry = Arc::new(ListenerRegistry::new());
        let config = MllpConfig {
            port,
            bind_timeout: Duration::from_secs(5),
            bind_retry_interval: Duration::from_millis(50),
            ..test_config()
        };

        let racers: Vec<_> = ["ADT", "ORU"]
            .into_iter()
            .map(|route| {
                let registry = Arc::clone(&registry);
                let config = config.clone();
                let racer = thread::spawn(move || registry.register(&config, route, tagged(route)));
                thread::sleep(Duration::from_millis(100));
                racer
            })
            .collect();

        // Both are waiting on the port; freeing it lets the first bind.
        drop(taken);
        for racer in racers {
            assert_eq!(racer.join().unwrap().unwrap().port(), port);
        }
        assert_eq!(registry.ports(), vec![port]);
        assert_eq!(registry.handlers(port).unwrap().routes(), vec!["ADT", "ORU"]);
        registry.shutdown_all();
    }

    #[test]
    fn shutdown_all_stops_listeners() {
        let registry = ListenerRegistry::new();
        let first = registry.register(&test_config(), "*", tagged("a")).unwrap();
        let second = registry.register(&test_config(), "*", tagged("b")).unwrap();
        assert_ne!(first.port(), second.port());
        assert_eq!(registry.ports().len(), 2);

        registry.shutdown_all();
        assert!(registry.ports().is_empty());
    }
}
