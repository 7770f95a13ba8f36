use core::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};

use super::record::InvocationRecord;
use super::signature::MAX_ORDINALS;
use crate::error::{InterceptError, PatchError, RegistryError};
use crate::patch::BinaryPatcher;
use crate::types::ShapeKey;

/// Anything the registry can hold: a bare record, or a typed interception
/// wrapping one.
pub trait Intercepted: Send + Sync + 'static {
    fn record(&self) -> &InvocationRecord;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl Intercepted for InvocationRecord {
    fn record(&self) -> &InvocationRecord {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type Entries = Vec<Arc<dyn Intercepted>>;

/// Interceptions grouped by shape key, in registration order.
///
/// An entry's ordinal is its index and never changes; entries are only ever
/// removed all at once by [`clear`](Self::clear) or [`clear_all`](Self::clear_all).
#[derive(Clone)]
pub struct InterceptionRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    id: usize,
    patcher: BinaryPatcher,
    shapes: RwLock<HashMap<ShapeKey, Entries>>,
}

impl InterceptionRegistry {
    pub fn new(patcher: BinaryPatcher) -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        Self {
            inner: Arc::new(RegistryInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                patcher,
                shapes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn patcher(&self) -> &BinaryPatcher {
        &self.inner.patcher
    }

    /// Appends `entry` under `shape` and returns its ordinal. Does not
    /// install anything.
    pub fn register(&self, shape: ShapeKey, entry: Arc<dyn Intercepted>) -> Result<usize, RegistryError> {
        let mut shapes = self.inner.write();
        let entries = shapes.entry(shape.clone()).or_default();
        if entries.len() >= MAX_ORDINALS {
            return Err(RegistryError::OrdinalsExhausted {
                shape: shape.to_string(),
                limit: MAX_ORDINALS,
            });
        }
        entries.push(entry);
        let ordinal = entries.len() - 1;
        debug!("registered {} #{}", shape, ordinal);
        Ok(ordinal)
    }

    /// Claims `shape` for this registry and `target` for this process, builds
    /// the entry for the next ordinal, installs it, and only then appends it.
    /// A failed build or install leaves the registry unchanged and drops both
    /// claims.
    pub(crate) fn register_with<T, B>(&self, shape: &ShapeKey, target: usize, build: B) -> Result<Arc<T>, InterceptError>
    where
        T: Intercepted,
        B: FnOnce(usize) -> Result<Arc<T>, InterceptError>,
    {
        let mut shapes = self.inner.write();

        let duplicate = shapes
            .values()
            .flatten()
            .any(|e| e.record().target().entry() == target);
        if duplicate {
            return Err(PatchError::AlreadyInstalled { address: target }.into());
        }

        let ordinal = shapes.get(shape).map_or(0, Vec::len);
        if ordinal >= MAX_ORDINALS {
            return Err(RegistryError::OrdinalsExhausted {
                shape: shape.to_string(),
                limit: MAX_ORDINALS,
            }
            .into());
        }
        targets::claim(target, self.inner.id)?;

        let installed = routes::claim(shape, &self.inner)
            .map_err(InterceptError::from)
            .and_then(|()| {
                let entry = build(ordinal)?;
                self.inner.patcher.install(entry.record())?;
                Ok(entry)
            });
        let entry = match installed {
            Ok(entry) => entry,
            Err(e) => {
                targets::release(target, self.inner.id);
                if ordinal == 0 {
                    routes::release(shape, &self.inner);
                }
                return Err(e);
            }
        };
        shapes.entry(shape.clone()).or_default().push(entry.clone() as Arc<dyn Intercepted>);
        debug!("intercepting {} #{} at {:#x}", shape, ordinal, target);
        Ok(entry)
    }

    /// The entry registered `ordinal`-th for `shape`.
    pub fn lookup(&self, shape: &ShapeKey, ordinal: usize) -> Result<Arc<dyn Intercepted>, RegistryError> {
        self.inner.lookup(shape, ordinal)
    }

    pub fn len(&self, shape: &ShapeKey) -> usize {
        self.inner.read().get(shape).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values().all(Vec::is_empty)
    }

    /// Uninstalls and drops every entry of `shape`. Every entry is attempted;
    /// the first failure is returned.
    pub fn clear(&self, shape: &ShapeKey) -> Result<(), PatchError> {
        let removed = self.inner.write().remove(shape);
        routes::release(shape, &self.inner);
        self.inner.discard(removed.into_iter().flatten())
    }

    pub fn clear_all(&self) -> Result<(), PatchError> {
        let removed: Vec<(ShapeKey, Entries)> = self.inner.write().drain().collect();
        for (shape, _) in &removed {
            routes::release(shape, &self.inner);
        }
        self.inner.discard(removed.into_iter().flat_map(|(_, entries)| entries))
    }

    pub(crate) fn same_registry(&self, other: &Arc<RegistryInner>) -> bool {
        Arc::ptr_eq(&self.inner, other)
    }
}

impl RegistryInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ShapeKey, Entries>> {
        self.shapes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ShapeKey, Entries>> {
        self.shapes.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lookup(&self, shape: &ShapeKey, ordinal: usize) -> Result<Arc<dyn Intercepted>, RegistryError> {
        self.read()
            .get(shape)
            .and_then(|entries| entries.get(ordinal))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                shape: shape.to_string(),
                ordinal,
            })
    }

    fn discard(&self, entries: impl Iterator<Item = Arc<dyn Intercepted>>) -> Result<(), PatchError> {
        let mut first = None;
        for entry in entries {
            let record = entry.record();
            let mut lock = record.lock();
            if lock.is_installed() {
                if let Err(e) = self.patcher.uninstall_locked(&mut lock) {
                    warn!("failed to remove interception at {:#x}: {}", record.target().entry(), e);
                    first.get_or_insert(e);
                }
            }
            // A patch that could not be removed keeps its target claimed.
            if !lock.is_installed() {
                targets::release(record.target().entry(), self.id);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        // The route table is left alone here: dead claims are ignored there.
        let shapes = std::mem::take(self.shapes.get_mut().unwrap_or_else(PoisonError::into_inner));
        let _ = self.discard(shapes.into_values().flatten());
    }
}

/// Process-wide set of patched entry points. Machine code is shared by every
/// registry, so a target may be intercepted by at most one of them.
pub(crate) mod targets {
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock, PoisonError};

    use crate::error::PatchError;

    fn table() -> &'static Mutex<HashMap<usize, usize>> {
        static TARGETS: OnceLock<Mutex<HashMap<usize, usize>>> = OnceLock::new();
        TARGETS.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Records `entry` as patched by `registry`.
    pub(crate) fn claim(entry: usize, registry: usize) -> Result<(), PatchError> {
        let mut targets = table().lock().unwrap_or_else(PoisonError::into_inner);
        if targets.contains_key(&entry) {
            return Err(PatchError::AlreadyInstalled { address: entry });
        }
        targets.insert(entry, registry);
        Ok(())
    }

    /// Drops the claim on `entry` if `registry` holds it.
    pub(crate) fn release(entry: usize, registry: usize) {
        let mut targets = table().lock().unwrap_or_else(PoisonError::into_inner);
        if targets.get(&entry) == Some(&registry) {
            targets.remove(&entry);
        }
    }

    #[cfg(test)]
    pub(crate) fn holder(entry: usize) -> Option<usize> {
        table().lock().unwrap_or_else(PoisonError::into_inner).get(&entry).copied()
    }
}

/// Process-wide shape -> registry routing used by trampolines.
pub(crate) mod routes {
    use std::collections::HashMap;
    use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

    use super::RegistryInner;
    use crate::error::RegistryError;
    use crate::types::ShapeKey;

    type Table = RwLock<HashMap<ShapeKey, Weak<RegistryInner>>>;

    fn table() -> &'static Table {
        static ROUTES: OnceLock<Table> = OnceLock::new();
        ROUTES.get_or_init(|| RwLock::new(HashMap::new()))
    }

    /// Routes `shape` to `registry` unless another live registry holds it.
    pub(crate) fn claim(shape: &ShapeKey, registry: &Arc<RegistryInner>) -> Result<(), RegistryError> {
        let mut routes = table().write().unwrap_or_else(PoisonError::into_inner);
        let owner = routes.get(shape).and_then(Weak::upgrade);
        let claimed = match &owner {
            Some(owner) if !Arc::ptr_eq(owner, registry) => {
                Err(RegistryError::ShapeClaimed { shape: shape.to_string() })
            }
            Some(_) => Ok(()),
            None => {
                routes.insert(shape.clone(), Arc::downgrade(registry));
                Ok(())
            }
        };
        // `owner` may be the last handle; never run its Drop under the table lock.
        drop(routes);
        drop(owner);
        claimed
    }

    pub(crate) fn release(shape: &ShapeKey, registry: &Arc<RegistryInner>) {
        let mut routes = table().write().unwrap_or_else(PoisonError::into_inner);
        if routes.get(shape).is_some_and(|w| w.as_ptr() == Arc::as_ptr(registry)) {
            routes.remove(shape);
        }
    }

    /// The live registry routed for `shape`.
    pub(crate) fn owner(shape: &ShapeKey) -> Option<Arc<RegistryInner>> {
        let routes = table().read().unwrap_or_else(PoisonError::into_inner);
        routes.get(shape).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, PointerWidth};
    use crate::code::CodePage;
    use crate::testing::ScriptedPlugin;
    use crate::types::{CallSignature, FunctionHandle};
    use std::thread;

    struct Keyed;
    struct Claimed;
    struct Released;
    struct Growing;
    struct Contended;
    struct Rival;
    struct Abandoned;

    fn shape<O: 'static>() -> ShapeKey {
        ShapeKey::of::<O, fn(i32) -> i32>()
    }

    fn patcher() -> BinaryPatcher {
        BinaryPatcher::for_architecture(Architecture::x86_64())
    }

    fn remote(plugin: &Arc<ScriptedPlugin>) -> InterceptionRegistry {
        InterceptionRegistry::new(BinaryPatcher::remote(
            Architecture::foreign(PointerWidth::Bits64),
            plugin.clone(),
        ))
    }

    fn record(entry: usize) -> Arc<InvocationRecord> {
        let sig = CallSignature::of::<fn(i32) -> i32>();
        Arc::new(
            InvocationRecord::new(
                FunctionHandle::new(entry, sig.clone()),
                FunctionHandle::new(entry + 0x100, sig),
                &Architecture::x86_64(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn ordinals_follow_registration_order() {
        let registry = InterceptionRegistry::new(patcher());
        let key = shape::<Keyed>();
        let records: Vec<_> = (0..3).map(|i| record(0x10_000 + i * 0x1000)).collect();

        for (i, r) in records.iter().enumerate() {
            assert_eq!(registry.register(key.clone(), r.clone()).unwrap(), i);
        }
        assert_eq!(registry.len(&key), 3);

        let second = records[1].target().entry();
        thread::scope(|s| {
            for t in 0..8 {
                let registry = &registry;
                let key = &key;
                s.spawn(move || {
                    for _ in 0..200 {
                        let noise = if t % 2 == 0 { 0 } else { 2 };
                        registry.lookup(key, noise).unwrap();
                        assert_eq!(registry.lookup(key, 1).unwrap().record().target().entry(), second);
                    }
                });
            }
        });
    }

    #[test]
    fn lookup_of_unknown_ordinal_fails() {
        let registry = InterceptionRegistry::new(patcher());
        let key = shape::<Keyed>();
        assert!(matches!(registry.lookup(&key, 0), Err(RegistryError::NotFound { ordinal: 0, .. })));
        registry.register(key.clone(), record(0x20_000)).unwrap();
        assert!(matches!(registry.lookup(&key, 1), Err(RegistryError::NotFound { ordinal: 1, .. })));
    }

    #[test]
    fn registration_is_capped_per_shape() {
        let registry = InterceptionRegistry::new(patcher());
        let key = shape::<Keyed>();
        for i in 0..MAX_ORDINALS {
            registry.register(key.clone(), record(0x30_000 + i * 0x100)).unwrap();
        }
        assert!(matches!(
            registry.register(key, record(0x40_000)),
            Err(RegistryError::OrdinalsExhausted { limit: MAX_ORDINALS, .. })
        ));
    }

    #[test]
    fn clear_uninstalls_installed_entries() {
        let mut page = CodePage::new(4096).expect("map");
        page.make_executable().expect("rx");
        let base = page.address();
        let before = unsafe { crate::code::patcher::read_code(base, 13) };

        let registry = InterceptionRegistry::new(patcher());
        let key = shape::<Keyed>();
        let installed = record(base);
        registry.patcher().install(&installed).unwrap();
        registry.register(key.clone(), installed.clone()).unwrap();
        registry.register(key.clone(), record(base + 0x40)).unwrap();

        registry.clear(&key).unwrap();
        assert!(!installed.is_installed());
        assert_eq!(registry.len(&key), 0);
        assert!(registry.is_empty());
        assert_eq!(unsafe { crate::code::patcher::read_code(base, 13) }, before);
    }

    #[test]
    fn dropping_registry_removes_patches() {
        let mut page = CodePage::new(4096).expect("map");
        page.make_executable().expect("rx");
        let installed = record(page.address());
        {
            let registry = InterceptionRegistry::new(patcher());
            registry.patcher().install(&installed).unwrap();
            registry.register(shape::<Keyed>(), installed.clone()).unwrap();
            assert!(installed.is_installed());
        }
        assert!(!installed.is_installed());
    }

    #[test]
    fn a_shape_routes_to_one_live_registry() {
        let first = InterceptionRegistry::new(patcher());
        let second = InterceptionRegistry::new(patcher());
        let key = shape::<Claimed>();

        routes::claim(&key, &first.inner).unwrap();
        routes::claim(&key, &first.inner).unwrap();
        assert!(matches!(
            routes::claim(&key, &second.inner),
            Err(RegistryError::ShapeClaimed { .. })
        ));
        assert!(first.same_registry(&routes::owner(&key).unwrap()));

        drop(first);
        routes::claim(&key, &second.inner).unwrap();
        assert!(second.same_registry(&routes::owner(&key).unwrap()));
    }

    #[test]
    fn clearing_a_shape_releases_its_route() {
        let first = InterceptionRegistry::new(patcher());
        let second = InterceptionRegistry::new(patcher());
        let key = shape::<Released>();

        routes::claim(&key, &first.inner).unwrap();
        first.clear(&key).unwrap();
        assert!(routes::owner(&key).is_none());
        routes::claim(&key, &second.inner).unwrap();
    }

    #[test]
    fn registration_runs_alongside_lookups() {
        let registry = InterceptionRegistry::new(patcher());
        let key = shape::<Growing>();
        let base = 0x70_000;
        registry.register(key.clone(), record(base)).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                for i in 1..MAX_ORDINALS {
                    registry.register(key.clone(), record(base + i * 0x100)).unwrap();
                    thread::yield_now();
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        assert_eq!(registry.lookup(&key, 0).unwrap().record().target().entry(), base);
                        let last = registry.len(&key) - 1;
                        let entry = registry.lookup(&key, last).unwrap();
                        assert_eq!(entry.record().target().entry(), base + last * 0x100);
                    }
                });
            }
        });
        assert_eq!(registry.len(&key), MAX_ORDINALS);
    }

    #[test]
    fn a_target_is_patched_by_one_registry_at_a_time() {
        let plugin = Arc::new(ScriptedPlugin::default());
        let first = remote(&plugin);
        let second = remote(&plugin);
        let target = 0x50_000;

        first.register_with(&shape::<Contended>(), target, |_| Ok(record(target))).unwrap();
        assert_eq!(
            second.register_with(&shape::<Rival>(), target, |_| Ok(record(target))).unwrap_err(),
            InterceptError::Patch(PatchError::AlreadyInstalled { address: target })
        );
        assert_eq!(second.len(&shape::<Rival>()), 0);
        assert_eq!(plugin.log(), ["install"]);

        drop(first);
        assert_eq!(plugin.log(), ["install", "uninstall"]);
        assert_eq!(targets::holder(target), None);

        second.register_with(&shape::<Rival>(), target, |_| Ok(record(target))).unwrap();
        assert_eq!(targets::holder(target), Some(second.inner.id));
        second.clear_all().unwrap();
        assert_eq!(targets::holder(target), None);
    }

    #[test]
    fn failed_install_releases_an_unused_shape() {
        let plugin = Arc::new(ScriptedPlugin::default());
        let failing = remote(&plugin);
        let key = shape::<Abandoned>();
        let target = 0x60_000;

        plugin.fail_next_install();
        let err = failing.register_with(&key, target, |_| Ok(record(target))).unwrap_err();
        assert!(matches!(err, InterceptError::Patch(PatchError::Remote { .. })));
        assert!(routes::owner(&key).is_none());
        assert_eq!(targets::holder(target), None);
        assert_eq!(failing.len(&key), 0);

        let other = remote(&plugin);
        other.register_with(&key, target, |_| Ok(record(target))).unwrap();
        assert!(other.same_registry(&routes::owner(&key).unwrap()));

        // A shape with live entries keeps its route through a later failure.
        plugin.fail_next_install();
        let next = target + 0x100;
        assert!(other.register_with(&key, next, |_| Ok(record(next))).is_err());
        assert!(other.same_registry(&routes::owner(&key).unwrap()));
        assert_eq!(other.len(&key), 1);
        assert_eq!(targets::holder(next), None);
    }
}
