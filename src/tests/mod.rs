mod auth;
mod if_walk;
mod location_walk;
mod subrequest;

use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rustc_hash::FxHashMap;

use crate::{
    config::{ConfigVector, CoreDirConfig, CoreServerConfig, DirConfig, ModuleId},
    request::Request,
    ConditionEval, HtaccessLoader, PipelineGeneric,
};

pub(crate) use memory_fs::MemoryFS;

pub(crate) type TestPipeline = PipelineGeneric<MemoryFS>;

/// Slot used by the tagging test module.
pub(crate) const PROBE_MODULE: ModuleId = ModuleId(1);

/// A per-module record that logs merge order and counts merges, so tests
/// can observe exactly which sections a walk folded in.
pub(crate) struct Probe {
    pub tags: Vec<&'static str>,
    pub merges: Arc<AtomicUsize>,
}

impl DirConfig for Probe {
    fn merge(&self, overlay: &dyn DirConfig) -> Arc<dyn DirConfig> {
        self.merges.fetch_add(1, Ordering::Relaxed);
        let mut tags = self.tags.clone();
        if let Some(overlay) = overlay.as_any().downcast_ref::<Probe>() {
            tags.extend(&overlay.tags);
        }
        Arc::new(Probe { tags, merges: Arc::clone(&self.merges) })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A section config carrying the given core record plus a probe tag.
pub(crate) fn tagged(
    tag: &'static str,
    merges: &Arc<AtomicUsize>,
    core: CoreDirConfig,
) -> Arc<ConfigVector> {
    let mut vector = ConfigVector::with_core(core);
    vector.set(
        PROBE_MODULE,
        Arc::new(Probe { tags: vec![tag], merges: Arc::clone(merges) }),
    );
    Arc::new(vector)
}

/// The probe tags visible in a request's effective configuration.
pub(crate) fn tags_of(r: &Request) -> Vec<&'static str> {
    r.per_dir_config
        .get::<Probe>(PROBE_MODULE)
        .map(|probe| probe.tags.clone())
        .unwrap_or_default()
}

pub(crate) fn defaults() -> Arc<ConfigVector> {
    Arc::new(ConfigVector::with_core(CoreDirConfig::default()))
}

pub(crate) fn server_with(defaults: Arc<ConfigVector>) -> CoreServerConfig {
    CoreServerConfig::new(defaults)
}

/// A ready pipeline over the given filesystem with no hooks registered.
pub(crate) fn pipeline(fs: MemoryFS, server: CoreServerConfig) -> TestPipeline {
    let mut pipeline = PipelineGeneric::new_with_file_system(fs, Arc::new(server));
    pipeline.finalize();
    pipeline
}

/// A pipeline that can serve `/srv/www`: name translation and a type
/// checker are wired up, everything else comes from `configure`.
pub(crate) fn serving(
    fs: MemoryFS,
    server: CoreServerConfig,
    configure: impl FnOnce(&mut crate::HookRegistry<MemoryFS>),
) -> TestPipeline {
    let mut pipeline = PipelineGeneric::new_with_file_system(fs, Arc::new(server));
    pipeline.hooks_mut().translate_name.register(
        "docroot",
        Box::new(|_, r| {
            r.filename = Some(format!("/srv/www{}", r.uri));
            crate::Flow::Ok
        }),
    );
    pipeline
        .hooks_mut()
        .type_checker
        .register("mime", Box::new(|_, _| crate::Flow::Ok));
    configure(pipeline.hooks_mut());
    pipeline.finalize();
    pipeline
}

/// `.htaccess` loader backed by a map of directory → config, counting
/// every consultation.
#[derive(Default)]
pub(crate) struct MapHtaccess {
    pub files: FxHashMap<String, Arc<ConfigVector>>,
    pub loads: Arc<AtomicUsize>,
}

impl HtaccessLoader for MapHtaccess {
    fn load(
        &self,
        _r: &Request,
        dir: &str,
        _overrides: crate::OverrideSet,
        _override_opts: crate::AllowOptions,
        _override_list: Option<&[String]>,
        _access_name: &str,
    ) -> Result<Option<Arc<ConfigVector>>, crate::PipelineError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.files.get(dir).cloned())
    }
}

/// Expression evaluator backed by a fixed table.
#[derive(Default)]
pub(crate) struct TableEval {
    pub exprs: FxHashMap<String, bool>,
}

impl ConditionEval for TableEval {
    fn eval(&self, _r: &Request, expr: &str) -> Result<bool, String> {
        self.exprs
            .get(expr)
            .copied()
            .ok_or_else(|| format!("unknown expression: {expr}"))
    }
}
