#[cfg(test)]
pub mod env {
    use parking_lot::{const_mutex, Mutex, MutexGuard};

    /// Variables read by `apply_env_overrides`.
    pub const OVERRIDE_KEYS: &[&str] = &[
        "SCRIBE_POOL_MAX_SIZE",
        "SCRIBE_POOL_ACQUIRE_TIMEOUT_MS",
        "SCRIBE_POOL_MAX_RETRIES",
        "SCRIBE_CACHE_MAX_AGE_MS",
        "SCRIBE_CACHE_MAX_SIZE",
        "SCRIBE_VALIDATOR_URL",
    ];

    static ENV_LOCK: Mutex<()> = const_mutex(());

    /// Process environment with every config override unset. Holding it
    /// serializes env access between tests; prior values return on drop.
    pub struct OverrideEnv {
        _lock: MutexGuard<'static, ()>,
        prior: Vec<(&'static str, Option<String>)>,
    }

    impl OverrideEnv {
        pub fn isolated() -> Self {
            let lock = ENV_LOCK.lock();
            let prior = OVERRIDE_KEYS
                .iter()
                .map(|&key| (key, std::env::var(key).ok()))
                .collect();
            for key in OVERRIDE_KEYS {
                std::env::remove_var(key);
            }
            Self { _lock: lock, prior }
        }

        pub fn with(self, key: &str, value: &str) -> Self {
            assert!(
                OVERRIDE_KEYS.contains(&key),
                "{key} is not a config override"
            );
            std::env::set_var(key, value);
            self
        }
    }

    impl Drop for OverrideEnv {
        fn drop(&mut self) {
            for (key, value) in &self.prior {
                match value {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}
