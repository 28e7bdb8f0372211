//! Scenario 4 (takeover/resume) from the client's perspective: the saved
//! identity round-trips through the state file and is only offered back
//! to the server when `server_url`/`protocol` match the current
//! invocation (`spec.md` §4.3 "Init", §8 scenario 4).
//!
//! `tunnel_client::state` resolves its file under `dirs::config_dir()`,
//! which honors `XDG_CONFIG_HOME` on Linux — these tests point that at a
//! throwaway directory so they don't touch the real user config. The env
//! var is process-global, so the two tests here share one guard mutex
//! instead of running concurrently.

use std::sync::Mutex;

use tunnel_client::state::{self, ResumeState};

static ENV_GUARD: Mutex<()> = Mutex::new(());

fn with_isolated_config_dir<F: FnOnce()>(f: F) {
    let _lock = ENV_GUARD.lock().unwrap();
    let dir = std::env::temp_dir().join(format!("tunnel-client-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let previous = std::env::var_os("XDG_CONFIG_HOME");
    std::env::set_var("XDG_CONFIG_HOME", &dir);

    f();

    match previous {
        Some(v) => std::env::set_var("XDG_CONFIG_HOME", v),
        None => std::env::remove_var("XDG_CONFIG_HOME"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

fn sample_state() -> ResumeState {
    ResumeState {
        tunnel_id: "11111111-1111-1111-1111-111111111111".into(),
        subdomain: "foo".into(),
        public_url: "http://foo.example.test".into(),
        local_url: "http://127.0.0.1:9000".into(),
        server_url: "ws://127.0.0.1:7070".into(),
        protocol: "http".into(),
        host: None,
        created_at: 1000,
        last_used: 2000,
    }
}

#[test]
fn save_then_load_round_trips_and_is_owner_only() {
    with_isolated_config_dir(|| {
        let saved = sample_state();
        state::save(&saved).expect("save should succeed");

        let loaded =
            state::load(&saved.server_url, &saved.protocol).expect("load should find the file");
        assert_eq!(loaded.tunnel_id, saved.tunnel_id);
        assert_eq!(loaded.subdomain, saved.subdomain);
        assert_eq!(loaded.public_url, saved.public_url);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = state::resume_file_path().unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "resume file must be owner-read/write only");
        }
    });
}

#[test]
fn load_refuses_identity_from_a_different_server_or_protocol() {
    with_isolated_config_dir(|| {
        let saved = sample_state();
        state::save(&saved).expect("save should succeed");

        assert!(
            state::load("ws://a-different-relay.example.test:7070", &saved.protocol).is_none(),
            "a mismatched server_url must not resume the saved identity"
        );
        assert!(
            state::load(&saved.server_url, "tcp").is_none(),
            "a mismatched protocol must not resume the saved identity"
        );
        assert!(state::load(&saved.server_url, &saved.protocol).is_some());
    });
}

#[test]
fn load_returns_none_when_no_file_exists() {
    with_isolated_config_dir(|| {
        assert!(state::load("ws://127.0.0.1:7070", "http").is_none());
    });
}
