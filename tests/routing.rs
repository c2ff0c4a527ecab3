//! End-to-end routing scenarios: fairness, ring stability, id saturation,
//! balancing factor, stop semantics and pool ordering.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use dnslb::{
    Availability, Backend, BackendConfig, PendingQuery, Router, Settings,
};

fn settings() -> Arc<Settings> {
    Arc::new(Settings {
        hash_perturbation: 0x1234_5678,
        max_udp_outstanding: 64,
        ..Settings::default()
    })
}

fn up_backend(name: &str, settings: &Arc<Settings>) -> Arc<Backend> {
    backend_with(
        BackendConfig {
            name: name.to_string(),
            availability: Availability::Up,
            ..BackendConfig::default()
        },
        settings,
    )
}

fn backend_with(config: BackendConfig, settings: &Arc<Settings>) -> Arc<Backend> {
    Backend::new(config, Arc::clone(settings), false).unwrap()
}

#[test]
fn round_robin_is_fair_over_a_healthy_pool() {
    let settings = settings();
    let router = Router::new(Arc::clone(&settings));
    router.set_pool_policy_by_name("lb", "roundrobin").unwrap();
    for name in ["b1", "b2", "b3"] {
        router.add_server_to_pool("lb", up_backend(name, &settings));
    }

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..900 {
        let selected = router
            .select_server("q.example.com", 1, 1, "lb")
            .unwrap()
            .unwrap();
        *counts.entry(selected.name().to_string()).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    for (name, count) in counts {
        assert_eq!(count, 300, "backend {name} got {count} of 900");
    }
}

#[test]
fn consistent_hashing_is_stable_under_membership_change() {
    let settings = settings();
    let router = Router::new(Arc::clone(&settings));
    router.set_pool_policy_by_name("lb", "chashed").unwrap();

    let mut backends = Vec::new();
    for (index, name) in ["b1", "b2", "b3", "b4"].iter().enumerate() {
        let backend = backend_with(
            BackendConfig {
                name: (*name).to_string(),
                id: Some(Uuid::from_u128(0x1000 + index as u128)),
                weight: 100,
                availability: Availability::Up,
                ..BackendConfig::default()
            },
            &settings,
        );
        router.add_server_to_pool("lb", Arc::clone(&backend));
        backends.push(backend);
    }

    let names: Vec<String> = (0..10_000)
        .map(|index| format!("host-{index}.example.com"))
        .collect();

    let map_all = |router: &Router| -> HashMap<String, String> {
        names
            .iter()
            .map(|name| {
                let selected = router.select_server(name, 1, 1, "lb").unwrap().unwrap();
                (name.clone(), selected.name().to_string())
            })
            .collect()
    };

    let before = map_all(&router);

    // Same name, same backend, as long as membership holds.
    for name in names.iter().take(100) {
        let again = router.select_server(name, 1, 1, "lb").unwrap().unwrap();
        assert_eq!(again.name(), before[name]);
    }

    router.remove_server_from_pool("lb", &backends[1]);
    let after = map_all(&router);

    let mut changed = 0;
    for name in &names {
        if before[name] != after[name] {
            changed += 1;
            // Only keys that used to live on the removed backend may move.
            assert_eq!(
                before[name], "b2",
                "{name} moved away from a surviving backend"
            );
        }
    }

    let fraction = f64::from(changed) / names.len() as f64;
    assert!(
        fraction <= 0.30,
        "{changed} of {} keys changed target ({fraction:.3})",
        names.len()
    );
}

#[test]
fn id_slots_reuse_under_saturation() {
    let settings = Arc::new(Settings {
        max_udp_outstanding: 4,
        ..Settings::default()
    });
    let backend = up_backend("b", &settings);

    let evicted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&evicted);
    backend.set_timeout_handler(move |query: PendingQuery| {
        sink.lock().unwrap().push(query.qname);
    });

    let mut ids = Vec::new();
    for index in 0..5 {
        ids.push(backend.save_state(PendingQuery::new(format!("q{index}.example.com"), 1, 1)));
    }

    assert_eq!(&ids[..4], &[0, 1, 2, 3]);
    assert!(ids[4] < 4);
    assert_eq!(backend.stats().outstanding(), 4);
    assert_eq!(backend.stats().reuseds(), 1);

    // The evicted context was surfaced as a synthesized timeout.
    let evicted = evicted.lock().unwrap();
    assert_eq!(evicted.as_slice(), ["q0.example.com"]);
}

#[test]
fn weighted_random_balancing_factor_caps_share() {
    let settings = Arc::new(Settings {
        weighted_balancing_factor: 1.5,
        max_udp_outstanding: 64,
        ..Settings::default()
    });
    let router = Router::new(Arc::clone(&settings));
    router.set_pool_policy_by_name("lb", "wrandom").unwrap();

    let b1 = up_backend("b1", &settings);
    let b2 = up_backend("b2", &settings);
    for _ in 0..1000 {
        b1.stats().record_query();
    }
    router.add_server_to_pool("lb", Arc::clone(&b1));
    router.add_server_to_pool("lb", Arc::clone(&b2));

    let mut b2_selections = 0u32;
    for _ in 0..1000 {
        let selected = router
            .select_server("q.example.com", 1, 1, "lb")
            .unwrap()
            .unwrap();
        selected.stats().record_query();
        if selected.name() == "b2" {
            b2_selections += 1;
        }
    }

    // The cold backend soaks up traffic until the hot one is back under
    // the cap, then the split levels out.
    assert!(
        (550..=800).contains(&b2_selections),
        "b2 got {b2_selections} of 1000"
    );

    let q1 = b1.stats().queries() as f64;
    let q2 = b2.stats().queries() as f64;
    let mean = (q1 + q2) / 2.0;
    assert!(
        q1.max(q2) <= 1.5 * mean + 50.0,
        "share cap violated: q1={q1} q2={q2}"
    );
}

#[test]
fn stop_unblocks_a_pending_receive() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let settings = settings();
    let config = BackendConfig {
        name: "local".to_string(),
        remote: peer.local_addr().unwrap(),
        availability: Availability::Up,
        ..BackendConfig::default()
    };
    let backend = Backend::new(config, Arc::clone(&settings), true).unwrap();
    assert!(backend.is_connected());
    assert!(backend.is_up());

    let socket = backend.pick_socket_for_sending().unwrap();
    let (tx, rx) = mpsc::channel();
    let receiver = thread::spawn(move || {
        let mut buf = [MaybeUninit::<u8>::uninit(); 512];
        let _ = socket.recv(&mut buf);
        tx.send(()).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    backend.stop();

    rx.recv_timeout(Duration::from_millis(500))
        .expect("receiver did not unblock after stop()");
    receiver.join().unwrap();

    assert!(!backend.is_up());
    assert!(!Backend::reconnect(&backend, false));
}

#[test]
fn pool_ordering_follows_order_then_insertion() {
    let settings = settings();
    let router = Router::new(Arc::clone(&settings));

    let make = |name: &str, order: i32| {
        backend_with(
            BackendConfig {
                name: name.to_string(),
                order,
                availability: Availability::Up,
                ..BackendConfig::default()
            },
            &settings,
        )
    };
    let b1 = make("b1", 5);
    let b2 = make("b2", 1);
    let b3 = make("b3", 3);
    router.add_server_to_pool("lb", Arc::clone(&b1));
    router.add_server_to_pool("lb", Arc::clone(&b2));
    router.add_server_to_pool("lb", Arc::clone(&b3));

    let pool = router.pool("lb").unwrap();
    let layout: Vec<(u32, &str)> = pool
        .servers()
        .iter()
        .map(|(ordinal, server)| (*ordinal, server.name()))
        .collect();
    assert_eq!(layout, vec![(1, "b2"), (2, "b3"), (3, "b1")]);

    router.remove_server_from_pool("lb", &b3);
    let pool = router.pool("lb").unwrap();
    let layout: Vec<(u32, &str)> = pool
        .servers()
        .iter()
        .map(|(ordinal, server)| (*ordinal, server.name()))
        .collect();
    assert_eq!(layout, vec![(1, "b2"), (2, "b1")]);
}

#[test]
fn save_then_get_observes_each_context_exactly_once() {
    let settings = settings();
    let backend = up_backend("b", &settings);
    let timeouts = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&timeouts);
    backend.set_timeout_handler(move |_| {
        sink.fetch_add(1, Ordering::Relaxed);
    });

    let mut slots = Vec::new();
    for index in 0..32 {
        slots.push((
            backend.save_state(PendingQuery::new(format!("q{index}.example.com"), 1, 1)),
            index,
        ));
    }

    let mut recovered = 0;
    for (id, index) in slots {
        if let Some(query) = backend.get_state(id) {
            assert_eq!(query.qname, format!("q{index}.example.com"));
            recovered += 1;
        }
    }

    // Every context came back exactly once: either via get_state or,
    // had anything expired, through the timeout handler.
    assert_eq!(recovered + timeouts.load(Ordering::Relaxed), 32);
    assert_eq!(backend.stats().outstanding(), 0);
}
