use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine and WAL file per database name, created on first use.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    engine_config: EngineConfig,
}

/// Keep `[A-Za-z0-9_-]`, so a tenant name can never escape the data directory.
fn wal_file_stem(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let stem: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if stem.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(stem)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, engine_config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            engine_config,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The shard lock on the stem's entry is held while the engine is built,
        // so two first connections never open the same WAL twice. Names that
        // sanitize to the same stem share the engine.
        let engine = match self.engines.entry(stem.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.engine_config,
                )?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                tracing::info!(tenant = %stem, "tenant loaded");
                entry.insert(engine).clone()
            }
        };
        if tenant != stem {
            self.engines.insert(tenant.to_string(), engine.clone());
        }
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("menaje_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, EngineConfig::default())
    }

    #[tokio::test]
    async fn tenants_do_not_share_stock() {
        let tm = manager(test_data_dir("isolation"));
        let a = tm.get_or_create("salon_a").unwrap();
        let b = tm.get_or_create("salon_b").unwrap();

        let item = InventoryItem {
            id: Ulid::new(),
            nombre: "Mantel".into(),
            unidad: Unidad::Pieza,
            stock_total: 5,
        };
        a.upsert_item(item.clone()).await.unwrap();

        assert_eq!(a.list_items().await, vec![item]);
        assert!(b.list_items().await.is_empty());
    }

    #[tokio::test]
    async fn wal_file_is_created_lazily() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("eventos").unwrap();
        assert!(dir.join("eventos.wal").exists());
    }

    #[tokio::test]
    async fn same_name_returns_same_engine() {
        let tm = manager(test_data_dir("same"));
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let traversal = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        let plain = tm.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&traversal, &plain));

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn overlong_name_is_rejected() {
        let tm = manager(test_data_dir("too_long"));
        let Err(err) = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)) else {
            panic!("overlong tenant name was accepted");
        };
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_connections_share_one_engine() {
        let tm = Arc::new(manager(test_data_dir("race")));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tm = tm.clone();
            handles.push(tokio::spawn(async move { tm.get_or_create("salon").unwrap() }));
        }
        let mut engines = Vec::new();
        for handle in handles {
            engines.push(handle.await.unwrap());
        }
        for engine in &engines[1..] {
            assert!(Arc::ptr_eq(&engines[0], engine));
        }

        let item = InventoryItem {
            id: Ulid::new(),
            nombre: "Silla".into(),
            unidad: Unidad::Pieza,
            stock_total: 3,
        };
        engines[0].upsert_item(item.clone()).await.unwrap();
        assert_eq!(tm.get_or_create("salon").unwrap().list_items().await, vec![item]);
    }
}
