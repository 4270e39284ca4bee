use std::sync::{Arc, Mutex};

use pulse_core::registry::ExpiryMode;
use pulse_core::{Registry, RemovalCause};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Registry expiry and release
// ══════════════════════════════════════════════════════════════════════════════

type Log = Arc<Mutex<Vec<(String, RemovalCause)>>>;

fn logged(mode: ExpiryMode, clock: ClockMode, log: &Log) -> Registry<String, u32> {
    let releases = log.clone();
    Registry::builder(Duration::from_millis(30), 3)
        .expiry_mode(mode)
        .clock(clock)
        .on_release(move |key: String, _value: u32, cause| {
            releases.lock().unwrap().push((key, cause));
        })
        .build()
        .expect("valid registry config")
}

#[test]
fn test_entries_expire_without_refresh() {
    let log = Log::default();
    let registry = logged(ExpiryMode::Synchronous, ClockMode::Manual, &log);

    registry.insert("quiet".into(), 1);
    registry.insert("busy".into(), 2);

    // "busy" is refreshed after every tick, "quiet" never is.
    for round in 1..=5u32 {
        registry.tick();
        assert!(registry.touch("busy"));
        assert_eq!(registry.ttl("busy"), Some(3));
        match round {
            1 | 2 => assert_eq!(registry.ttl("quiet"), Some(3 - round)),
            _ => assert!(!registry.contains("quiet")),
        }
    }
    assert_eq!(
        log.lock().unwrap().clone(),
        vec![("quiet".to_string(), RemovalCause::Expired)]
    );

    // Once refreshes stop, "busy" lasts exactly one more interval.
    registry.tick();
    registry.tick();
    assert_eq!(registry.ttl("busy"), Some(1));
    registry.tick();
    assert!(registry.is_empty());
    assert!(!registry.touch("busy"));
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_clock_thread_expires_entries() -> Result<()> {
    let log = Log::default();
    let registry = logged(ExpiryMode::Synchronous, ClockMode::Thread, &log);
    registry.insert("quiet".into(), 1);
    wait_for_condition(|| log.lock().unwrap().len() == 1).await
}

#[tokio::test]
async fn test_deferred_expiry_can_reinsert() -> Result<()> {
    let log = Log::default();
    let seen = Arc::new(Mutex::new(None::<Registry<String, u32>>));
    let registry = {
        let seen = seen.clone();
        let releases = log.clone();
        Registry::builder(Duration::from_millis(20), 2)
            .expiry_mode(ExpiryMode::Deferred)
            .on_expire(move |key: &String, value: &u32| {
                if let Some(registry) = seen.lock().unwrap().as_ref() {
                    if *value == 0 {
                        registry.insert(format!("{key}-next"), 1);
                    }
                }
            })
            .on_release(move |key: String, _value: u32, cause| {
                releases.lock().unwrap().push((key, cause));
            })
            .build()
            .expect("valid registry config")
    };
    *seen.lock().unwrap() = Some(registry.clone());

    registry.insert("gen".into(), 0);
    wait_for_condition(|| registry.contains("gen-next")).await?;
    wait_for_condition(|| log.lock().unwrap().len() == 2).await?;
    assert!(!registry.contains("gen-next"));

    let causes: Vec<_> = log.lock().unwrap().iter().map(|(_, c)| *c).collect();
    assert_eq!(causes, vec![RemovalCause::Expired, RemovalCause::Expired]);

    // Break the registry -> callback -> registry cycle.
    seen.lock().unwrap().take();
    Ok(())
}

#[tokio::test]
async fn test_clear_and_remove_release_each_entry_once() -> Result<()> {
    let log = Log::default();
    let registry = logged(ExpiryMode::Synchronous, ClockMode::Manual, &log);
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        registry.insert(name.to_string(), i as u32);
    }
    assert!(registry.remove("b"));
    assert!(!registry.remove("b"));
    registry.clear();
    assert!(registry.is_empty());

    let mut released = log.lock().unwrap().clone();
    released.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(
        released,
        vec![
            ("a".to_string(), RemovalCause::Cleared),
            ("b".to_string(), RemovalCause::Removed),
            ("c".to_string(), RemovalCause::Cleared),
        ]
    );
    Ok(())
}
