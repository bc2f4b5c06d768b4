#[cfg(test)]
mod tests {
    use super::super::*;
    use std::env;

    fn clear_all() {
        for key in [
            "MAILCRUCIBLE_HOSTNAME",
            "MAILCRUCIBLE_SMTP_BIND_ADDRESSES",
            "MAILCRUCIBLE_MAX_CONNECTIONS",
            "MAILCRUCIBLE_PROXY_PROTOCOL",
            "MAILCRUCIBLE_SHUTDOWN_GRACE_SECS",
            "MAILCRUCIBLE_MAX_MESSAGE_SIZE",
            "MAILCRUCIBLE_SESSION_TIMEOUT_SECS",
            "MAILCRUCIBLE_TLS_CERT_PATH",
            "MAILCRUCIBLE_TLS_KEY_PATH",
            "MAILCRUCIBLE_AUTH_ENABLED",
            "MAILCRUCIBLE_ALLOW_PLAINTEXT_AUTH",
            "MAILCRUCIBLE_AUTH_USERS",
            "MAILCRUCIBLE_RELAY_MODE",
            "MAILCRUCIBLE_RELAY_HOST",
            "MAILCRUCIBLE_RELAY_PORT",
            "MAILCRUCIBLE_RELAY_CONCURRENT_CONNECTIONS",
            "MAILCRUCIBLE_RELAY_IDLE_TIMEOUT_SECS",
            "MAILCRUCIBLE_RELAY_FORCED_HOSTS",
            "MAILCRUCIBLE_STORAGE_BACKEND",
            "MAILCRUCIBLE_STORAGE_ROOT",
            "MAILCRUCIBLE_FORWARD_RULES",
            "MAILCRUCIBLE_SPLIT_PER_RECIPIENT",
            "MAILCRUCIBLE_HTTP_EDGE_BIND_ADDRESS",
            "MAILCRUCIBLE_HTTP_EDGE_PORT",
            "MAILCRUCIBLE_HEALTH_BIND_ADDRESS",
            "MAILCRUCIBLE_HEALTH_PORT",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn missing_hostname_is_an_error() {
        clear_all();
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_only_hostname_is_set() {
        clear_all();
        env::set_var("MAILCRUCIBLE_HOSTNAME", "mail.example.test");

        let config = Config::from_env().expect("config should load with only hostname set");

        assert_eq!(config.hostname, "mail.example.test");
        assert_eq!(config.smtp_bind_addresses, vec!["0.0.0.0:2525".to_string()]);
        assert_eq!(config.max_connections, 256);
        assert!(!config.proxy_protocol);
        assert_eq!(config.shutdown_grace_secs, 30);
        assert_eq!(config.max_message_size, 25 * 1024 * 1024);
        assert_eq!(config.session_timeout_secs, 300);
        assert!(config.tls_cert_path.is_none());
        assert!(!config.auth_enabled);
        assert!(!config.allow_plaintext_without_tls);
        assert!(config.auth_users.is_empty());
        assert!(matches!(config.relay_mode, RelayMode::Mx { port: 25 }));
        assert!(matches!(config.storage_backend, StorageBackend::Memory));
        assert_eq!(config.health_check_bind_address, "0.0.0.0");
        assert_eq!(config.health_check_port, 8080);

        clear_all();
    }

    #[test]
    fn overrides_are_parsed() {
        clear_all();
        env::set_var("MAILCRUCIBLE_HOSTNAME", "mail.example.test");
        env::set_var("MAILCRUCIBLE_SMTP_BIND_ADDRESSES", "127.0.0.1:2525, [::1]:2525");
        env::set_var("MAILCRUCIBLE_MAX_CONNECTIONS", "10");
        env::set_var("MAILCRUCIBLE_RELAY_MODE", "static");
        env::set_var("MAILCRUCIBLE_RELAY_HOST", "smtp.upstream.test");
        env::set_var("MAILCRUCIBLE_RELAY_PORT", "2525");
        env::set_var("MAILCRUCIBLE_STORAGE_BACKEND", "filesystem");
        env::set_var("MAILCRUCIBLE_STORAGE_ROOT", "/tmp/mailcrucible-test-queue");
        env::set_var("MAILCRUCIBLE_AUTH_USERS", "alice:hunter2,bob:correct-horse");
        env::set_var("MAILCRUCIBLE_RELAY_FORCED_HOSTS", "a.test=mx.a.test,b.test=mx.b.test");

        let config = Config::from_env().expect("config should load with overrides set");

        assert_eq!(
            config.smtp_bind_addresses,
            vec!["127.0.0.1:2525".to_string(), "[::1]:2525".to_string()]
        );
        assert_eq!(config.max_connections, 10);
        match config.relay_mode {
            RelayMode::Static { host, port } => {
                assert_eq!(host, "smtp.upstream.test");
                assert_eq!(port, 2525);
            }
            RelayMode::Mx { .. } => panic!("expected static relay mode"),
        }
        match config.storage_backend {
            StorageBackend::Filesystem { root } => assert_eq!(root, "/tmp/mailcrucible-test-queue"),
            StorageBackend::Memory => panic!("expected filesystem backend"),
        }
        assert_eq!(
            config.auth_users,
            vec![
                ("alice".to_string(), "hunter2".to_string()),
                ("bob".to_string(), "correct-horse".to_string())
            ]
        );
        assert_eq!(config.relay_forced_hosts.get("a.test").map(String::as_str), Some("mx.a.test"));
        assert_eq!(config.relay_forced_hosts.get("b.test").map(String::as_str), Some("mx.b.test"));

        clear_all();
    }

    #[test]
    fn static_relay_mode_without_host_is_an_error() {
        clear_all();
        env::set_var("MAILCRUCIBLE_HOSTNAME", "mail.example.test");
        env::set_var("MAILCRUCIBLE_RELAY_MODE", "static");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_all();
    }

    #[test]
    fn unknown_relay_mode_is_an_error() {
        clear_all();
        env::set_var("MAILCRUCIBLE_HOSTNAME", "mail.example.test");
        env::set_var("MAILCRUCIBLE_RELAY_MODE", "carrier-pigeon");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_all();
    }
}
