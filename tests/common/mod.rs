//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use civic_intake::identity::Credentials;
use civic_intake::services::user_service::{LoginInput, NameInput, StaffInput};
use civic_intake::services::Caller;
use civic_intake::{Config, Principal, Services, Store};
use tempfile::TempDir;

pub struct Harness {
    pub services: Arc<Services>,
    // Keeps the database file alive for the test
    _dir: TempDir,
}

impl Harness {
    /// File-backed store so pooled connections really race each other
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            jwt_secret: Some("integration-test-secret".into()),
            ..Config::default()
        };
        let store = Store::open_path(&config.database_path(), 8, 5_000).unwrap();
        let services = Services::new(Arc::new(store), Arc::new(config)).unwrap();
        Self {
            services: Arc::new(services),
            _dir: dir,
        }
    }

    pub fn device(&self, device_id: &str) -> Principal {
        self.services
            .resolve(Caller {
                credentials: None,
                device_id: Some(device_id),
            })
            .unwrap()
    }

    /// Log in with a password and resolve the resulting bearer token
    pub fn login(&self, username: &str, password: &str) -> Principal {
        let response = self
            .services
            .users
            .login(
                None,
                &LoginInput {
                    username: Some(username.into()),
                    password: Some(password.into()),
                },
            )
            .unwrap();
        let credentials = Credentials::from_authorization(&format!("Bearer {}", response.token.unwrap())).unwrap();
        self.services
            .resolve(Caller {
                credentials: Some(&credentials),
                device_id: None,
            })
            .unwrap()
    }

    pub fn admin(&self) -> Principal {
        self.services.users.bootstrap_admin("root", "root-password-1").unwrap();
        self.login("root", "root-password-1")
    }

    pub fn institution(&self, admin: &Principal, name: &str) -> String {
        self.services
            .users
            .create_institution(admin, &NameInput { name: name.into() })
            .unwrap()
            .id
    }

    pub fn institution_staff(&self, admin: &Principal, username: &str, institution_id: &str) -> Principal {
        self.services
            .users
            .create_staff(
                admin,
                &StaffInput {
                    username: username.into(),
                    password: "staff-password-1".into(),
                    role: "institution_staff".into(),
                    institution_id: Some(institution_id.into()),
                    department_id: None,
                    phone_number: None,
                },
            )
            .unwrap();
        self.login(username, "staff-password-1")
    }
}
