mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};

use civic_intake::identity::Credentials;
use civic_intake::services::user_service::RegisterInput;
use civic_intake::services::Caller;
use civic_intake::CivicError;
use common::Harness;

#[test]
fn concurrent_first_contact_yields_one_principal() {
    let harness = Harness::new();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let ids: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let services = harness.services.clone();
                let barrier = barrier.clone();
                scope.spawn(move || {
                    barrier.wait();
                    services
                        .resolve(Caller {
                            credentials: None,
                            device_id: Some("race-device-01"),
                        })
                        .map(|p| p.id)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().expect("every racer resolves"))
            .collect()
    });

    let distinct: HashSet<_> = ids.iter().collect();
    assert_eq!(distinct.len(), 1, "one principal per device, got {:?}", distinct);
    assert_eq!(harness.services.store.stats().unwrap().principals, 1);
}

#[test]
fn lookup_never_creates() {
    let harness = Harness::new();
    let caller = Caller {
        credentials: None,
        device_id: Some("never-seen"),
    };
    assert!(harness.services.lookup(caller).unwrap().is_none());
    assert_eq!(harness.services.store.stats().unwrap().principals, 0);

    let created = harness.device("never-seen");
    assert_eq!(created.username, "anon_never-se");
    assert_eq!(harness.services.lookup(caller).unwrap().map(|p| p.id), Some(created.id));
}

#[test]
fn missing_identity_is_rejected() {
    let harness = Harness::new();
    let result = harness.services.resolve(Caller {
        credentials: None,
        device_id: Some("   "),
    });
    assert!(matches!(result, Err(CivicError::MissingIdentity)));
}

#[test]
fn device_header_alone_cannot_act_as_registered_account() {
    let harness = Harness::new();
    let anon = harness.device("dev-2");
    let registered = harness
        .services
        .users
        .register(
            None,
            Some("dev-2"),
            &RegisterInput {
                username: "baraka".into(),
                password: "nyumba-456".into(),
                phone_number: None,
                role: None,
                institution_id: None,
                department_id: None,
            },
        )
        .unwrap();

    let device_only = Caller {
        credentials: None,
        device_id: Some("dev-2"),
    };
    assert!(matches!(harness.services.resolve(device_only), Err(CivicError::Auth(_))));
    assert!(matches!(harness.services.lookup(device_only), Err(CivicError::Auth(_))));
    // Nothing new was created for the device either
    assert_eq!(harness.services.store.stats().unwrap().principals, 1);

    let credentials = Credentials::from_authorization(&format!("Bearer {}", registered.token.unwrap())).unwrap();
    let account = harness
        .services
        .resolve(Caller {
            credentials: Some(&credentials),
            device_id: Some("dev-2"),
        })
        .unwrap();
    assert_eq!(account.id, anon.id);
    assert_eq!(harness.services.users.me(&account).unwrap().principal.username, "baraka");
}
