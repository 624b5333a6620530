use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// hold reaper + compactor. Tenant = database name from the pgwire
/// connection. All tenants publish into one shared hub; payloads carry the
/// tenant name.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    notify: Arc<NotifyHub>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            notify: Arc::new(NotifyHub::new()),
            data_dir,
            compact_threshold,
        }
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Every engine loaded so far.
    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines.iter().map(|e| e.value().clone()).collect()
    }

    /// Load every tenant that has a WAL in the data directory, so recovery
    /// sees orders from tenants nobody has connected to yet.
    pub fn load_existing(&self) -> std::io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "wal")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                self.get_or_create(stem)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let file_name = wal_file_name(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Entry lock: two connections racing on a new tenant must not open
        // the same WAL twice.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(file_name);
        let engine = Arc::new(Engine::new(tenant, wal_path, self.notify.clone())?);

        tokio::spawn(reaper::run_reaper(engine.clone()));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant engine loaded");
        Ok(engine)
    }
}

/// Tenant names map one-to-one onto WAL file stems: anything outside
/// `[A-Za-z0-9_-]` is rejected, never stripped.
fn wal_file_name(tenant: &str) -> std::io::Result<String> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string());
    if tenant.is_empty() {
        return Err(invalid("empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(invalid("tenant name too long"));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("tenant name may only contain letters, digits, '_' and '-'"));
    }
    Ok(format!("{tenant}.wal"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservoir_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();
        let admin_a = AuthContext::admin("tenant_a", "root");
        let admin_b = AuthContext::admin("tenant_b", "root");

        // Same resource id in both tenants
        let rid = Ulid::new();
        eng_a.create_resource(&admin_a, rid, None, None, Capacity::Exclusive).await.unwrap();
        eng_b.create_resource(&admin_b, rid, None, None, Capacity::Exclusive).await.unwrap();

        let span = Span::new(0, 10_000);
        eng_a
            .reserve(&admin_a, Ulid::new(), rid, Claim::Interval(span), None)
            .await
            .unwrap();

        // Tenant B's resource is untouched
        let avail_b = eng_b.compute_availability(&admin_b, rid, 0, 10_000).await.unwrap();
        assert_eq!(avail_b, vec![span]);
        let avail_a = eng_a.compute_availability(&admin_a, rid, 0, 10_000).await.unwrap();
        assert!(avail_a.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
        assert_eq!(tm.engines().len(), 1);
    }

    #[tokio::test]
    async fn unsafe_tenant_names_rejected() {
        let dir = test_data_dir("reject_names");
        let tm = TenantManager::new(dir.clone(), 1000);

        for name in ["../evil", "a/b", "", "caf\u{e9}"] {
            let err = tm.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{name:?}");
        }
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        assert!(tm.get_or_create("dorm-2_east").is_ok());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn load_existing_picks_up_wal_files() {
        let dir = test_data_dir("load_existing");
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            tm.get_or_create("north").unwrap();
            tm.get_or_create("south").unwrap();
        }

        let tm = TenantManager::new(dir, 1000);
        assert_eq!(tm.load_existing().unwrap(), 2);
        let mut names: Vec<String> = tm.engines().iter().map(|e| e.tenant.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["north".to_string(), "south".to_string()]);
    }
}
