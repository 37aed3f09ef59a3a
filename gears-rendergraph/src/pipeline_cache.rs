use std::sync::Arc;
use log::debug;
use gears_core::collections::hashmap::HashMap;
use gears_rhi::{PipelineDesc, PipelineHandle, RenderDevice, RhiError};

/// Pipelines keyed by their full description, so recompiles of an unchanged
/// graph reuse every pipeline.
pub struct PipelineCache {
    device: Arc<dyn RenderDevice>,
    pipelines: HashMap<PipelineDesc, PipelineHandle>,
}

impl PipelineCache {
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            device,
            pipelines: HashMap::default(),
        }
    }

    /// If this pipeline exists, return the cached one, otherwise create it.
    #[profiling::function]
    pub fn get_or_create(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle, RhiError> {
        if let Some(pipeline) = self.pipelines.get(desc) {
            return Ok(*pipeline);
        }

        let pipeline = self.device.create_pipeline(desc)?;
        debug!("Created pipeline \"{}\"", desc.name);
        self.pipelines.insert(desc.clone(), pipeline);
        Ok(pipeline)
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RenderDevice> { &self.device }

    #[inline]
    pub fn len(&self) -> usize { self.pipelines.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.pipelines.is_empty() }

    /// Destroy every cached pipeline. The device must not be using them.
    pub fn clear(&mut self) {
        for (_, pipeline) in self.pipelines.drain() {
            self.device.destroy_pipeline(pipeline);
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::headless::HeadlessDevice;
    use gears_rhi::{PipelineDescBuilder, ShaderBinary, ShaderProgram};

    fn desc(name: &str) -> PipelineDesc {
        PipelineDescBuilder::default()
            .name(name)
            .program(ShaderProgram::Compute(ShaderBinary::from_words(vec![0x0723_0203])))
            .build()
            .unwrap()
    }

    #[test]
    fn identical_descriptions_share_a_pipeline() {
        let device = Arc::new(HeadlessDevice::default());
        let mut cache = PipelineCache::new(device.clone());

        let a = cache.get_or_create(&desc("a")).unwrap();
        assert_eq!(cache.get_or_create(&desc("a")).unwrap(), a);
        assert_ne!(cache.get_or_create(&desc("b")).unwrap(), a);
        assert_eq!(cache.len(), 2);
        assert_eq!(device.live_pipeline_count(), 2);

        drop(cache);
        assert_eq!(device.live_pipeline_count(), 0);
    }
}
