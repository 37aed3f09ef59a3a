//! A device with a simulated GPU timeline.
//!
//! Submissions are queued in order and only complete when the CPU waits on a
//! fence (or the queue), or when [`HeadlessDevice::complete_next`] is called.
//! Every misuse a real driver would turn into undefined behaviour is reported
//! as an [`RhiError`] instead, and every queue interaction is appended to an
//! event log that tests can inspect.

use std::collections::VecDeque;
use std::time::Duration;
use derive_builder::Builder;
use log::{debug, trace};
use parking_lot::Mutex;
use slotmap::SlotMap;
use gears_core::collections::SmallVec;
use crate::buffer::{BufferDesc, MemoryLocation};
use crate::command::{BoundResource, Command, CommandList};
use crate::device::{DeviceFeatures, RenderDevice, SubmitInfo};
use crate::error::RhiError;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, PipelineHandle, QueueHandle,
    SemaphoreHandle, TextureHandle,
};
use crate::pipeline::{PipelineDesc, ShaderProgram};
use crate::texture::{TextureDesc, TextureDimension};

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct HeadlessDeviceConfig {
    #[builder(default = "\"headless\".to_owned()")]
    pub name: String,
    #[builder(default)]
    pub features: DeviceFeatures,
}

impl Default for HeadlessDeviceConfig {
    fn default() -> Self {
        Self { name: "headless".to_owned(), features: DeviceFeatures::default() }
    }
}

/// Queue activity recorded by the headless device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Submitted {
        submission: u64,
        command_buffers: Vec<CommandBufferHandle>,
        fence: Option<FenceHandle>,
    },
    Completed {
        submission: u64,
        fence: Option<FenceHandle>,
    },
    /// A CPU wait on `fence` returned successfully.
    FenceWaited { fence: FenceHandle },
    FenceReset { fence: FenceHandle },
    /// Signalled by the presentation engine rather than by a submission.
    ExternalSignal {
        fence: Option<FenceHandle>,
        semaphore: Option<SemaphoreHandle>,
    },
    QueueIdle,
    DeviceIdle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SemaphoreSignal {
    Unsignaled,
    /// A queued operation will signal it.
    Pending,
    Signaled,
}

struct FenceEntry {
    name: String,
    signaled: bool,
    pending: bool,
}

struct SemaphoreEntry {
    name: String,
    signal: SemaphoreSignal,
}

struct BufferEntry {
    desc: BufferDesc,
    data: Vec<u8>,
}

struct CommandBufferEntry {
    pool: CommandPoolHandle,
    commands: CommandList,
    in_flight: u32,
}

struct Submission {
    id: u64,
    command_buffers: SmallVec<[CommandBufferHandle; 2]>,
    signal_semaphores: SmallVec<[SemaphoreHandle; 2]>,
    fence: Option<FenceHandle>,
}

#[derive(Default)]
struct State {
    fences: SlotMap<FenceHandle, FenceEntry>,
    semaphores: SlotMap<SemaphoreHandle, SemaphoreEntry>,
    textures: SlotMap<TextureHandle, TextureDesc>,
    buffers: SlotMap<BufferHandle, BufferEntry>,
    pipelines: SlotMap<PipelineHandle, PipelineDesc>,
    pools: SlotMap<CommandPoolHandle, ()>,
    command_buffers: SlotMap<CommandBufferHandle, CommandBufferEntry>,

    queue: VecDeque<Submission>,
    next_submission: u64,
    max_outstanding_fences: usize,
    stalled: bool,
    submit_faults: VecDeque<RhiError>,
    events: Vec<DeviceEvent>,
}

impl State {
    fn outstanding_fences(&self) -> usize {
        self.queue.iter().filter(|submission| submission.fence.is_some()).count()
    }

    fn complete_front(&mut self) -> Option<u64> {
        let submission = self.queue.pop_front()?;
        for command_buffer in &submission.command_buffers {
            if let Some(entry) = self.command_buffers.get_mut(*command_buffer) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
        }
        for semaphore in &submission.signal_semaphores {
            if let Some(entry) = self.semaphores.get_mut(*semaphore) {
                entry.signal = SemaphoreSignal::Signaled;
            }
        }
        if let Some(fence) = submission.fence {
            if let Some(entry) = self.fences.get_mut(fence) {
                entry.signaled = true;
                entry.pending = false;
            }
        }
        trace!("headless: completed submission {}", submission.id);
        self.events.push(DeviceEvent::Completed { submission: submission.id, fence: submission.fence });
        Some(submission.id)
    }

    fn drain(&mut self) -> Result<(), RhiError> {
        if self.stalled && !self.queue.is_empty() {
            return Err(RhiError::DeviceLost);
        }
        while self.complete_front().is_some() {}
        Ok(())
    }

    fn consume_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<(), RhiError> {
        let entry = self.semaphores.get_mut(semaphore).ok_or(RhiError::InvalidHandle("semaphore"))?;
        let signal = entry.signal;
        if signal == SemaphoreSignal::Unsignaled {
            return Err(RhiError::SemaphoreNotSignaled(entry.name.clone()));
        }
        entry.signal = SemaphoreSignal::Unsignaled;
        if signal == SemaphoreSignal::Pending {
            // the waiter takes over the queued signal
            for submission in &mut self.queue {
                submission.signal_semaphores.retain(|queued| *queued != semaphore);
            }
        }
        Ok(())
    }

    fn validate_commands(&self, commands: &CommandList) -> Result<(), RhiError> {
        let texture = |handle: TextureHandle| {
            self.textures.contains_key(handle).then_some(()).ok_or(RhiError::InvalidHandle("texture"))
        };
        let buffer = |handle: BufferHandle| {
            self.buffers.contains_key(handle).then_some(()).ok_or(RhiError::InvalidHandle("buffer"))
        };
        let pipeline = |handle: PipelineHandle| {
            self.pipelines.contains_key(handle).then_some(()).ok_or(RhiError::InvalidHandle("pipeline"))
        };

        for command in commands {
            match command {
                Command::Barrier { textures, buffers } => {
                    textures.iter().try_for_each(|barrier| texture(barrier.texture))?;
                    buffers.iter().try_for_each(|barrier| buffer(barrier.buffer))?;
                }
                Command::BeginRendering { attachments, .. } => {
                    attachments.iter().try_for_each(|attachment| texture(attachment.texture))?;
                }
                Command::BindPipeline { pipeline: handle } => pipeline(*handle)?,
                Command::BindResources { pipeline: handle, bindings } => {
                    pipeline(*handle)?;
                    for binding in bindings {
                        match binding.resource {
                            BoundResource::SampledTexture(handle) |
                            BoundResource::StorageTexture(handle) => texture(handle)?,
                            BoundResource::UniformBuffer(handle) |
                            BoundResource::StorageBuffer(handle) => buffer(handle)?,
                        }
                    }
                }
                Command::CopyTexture { src, dst, .. } => {
                    texture(*src)?;
                    texture(*dst)?;
                }
                Command::BeginOperation { .. }
                | Command::EndOperation
                | Command::EndRendering
                | Command::Draw(_)
                | Command::Dispatch(_) => {}
            }
        }
        Ok(())
    }
}

pub struct HeadlessDevice {
    config: HeadlessDeviceConfig,
    state: Mutex<State>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessDeviceConfig) -> Self {
        debug!("Creating headless device \"{}\"", config.name);
        Self { config, state: Mutex::new(State::default()) }
    }

    /// Make the simulated GPU stop completing work.
    ///
    /// While stalled, bounded fence waits time out and unbounded waits report
    /// [`RhiError::DeviceLost`] instead of blocking forever.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Make the next valid submit fail with `err` without queuing anything.
    pub fn fail_next_submit(&self, err: RhiError) {
        self.state.lock().submit_faults.push_back(err);
    }

    /// Complete the oldest pending submission, returning its id.
    pub fn complete_next(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.stalled {
            return None;
        }
        state.complete_front()
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        if !state.stalled {
            while state.complete_front().is_some() {}
        }
    }

    /// Signal `fence` and `semaphore` on behalf of the presentation engine.
    pub fn signal_external(&self, fence: Option<FenceHandle>, semaphore: Option<SemaphoreHandle>) -> Result<(), RhiError> {
        let mut state = self.state.lock();
        if let Some(semaphore) = semaphore {
            let entry = state.semaphores.get_mut(semaphore).ok_or(RhiError::InvalidHandle("semaphore"))?;
            if entry.signal != SemaphoreSignal::Unsignaled {
                return Err(RhiError::SemaphoreAlreadySignaled(entry.name.clone()));
            }
            entry.signal = SemaphoreSignal::Signaled;
        }
        if let Some(fence) = fence {
            let entry = state.fences.get_mut(fence).ok_or(RhiError::InvalidHandle("fence"))?;
            if entry.signaled || entry.pending {
                return Err(RhiError::FenceInUse(entry.name.clone()));
            }
            entry.signaled = true;
        }
        state.events.push(DeviceEvent::ExternalSignal { fence, semaphore });
        Ok(())
    }

    /// Wait on semaphores from the presentation engine's side.
    pub fn consume_semaphores(&self, semaphores: &[SemaphoreHandle]) -> Result<(), RhiError> {
        let mut state = self.state.lock();
        semaphores.iter().try_for_each(|semaphore| state.consume_semaphore(*semaphore))
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Fences attached to submissions that have not completed yet.
    pub fn outstanding_fences(&self) -> usize {
        self.state.lock().outstanding_fences()
    }

    /// Highest value [`Self::outstanding_fences`] ever reached.
    pub fn max_outstanding_fences(&self) -> usize {
        self.state.lock().max_outstanding_fences
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().next_submission
    }

    /// The list a command buffer was recorded from.
    pub fn command_list(&self, command_buffer: CommandBufferHandle) -> Option<CommandList> {
        self.state.lock().command_buffers.get(command_buffer).map(|entry| entry.commands.clone())
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.state.lock().textures.get(texture).cloned()
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(buffer).map(|entry| entry.data.clone())
    }

    pub fn live_texture_count(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HeadlessDeviceConfig::default())
    }
}

impl RenderDevice for HeadlessDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn features(&self) -> DeviceFeatures {
        self.config.features
    }

    fn graphics_queue(&self) -> QueueHandle {
        QueueHandle(0)
    }

    fn create_command_pool(&self, queue: QueueHandle) -> Result<CommandPoolHandle, RhiError> {
        if queue != self.graphics_queue() {
            return Err(RhiError::InvalidHandle("queue"));
        }
        Ok(self.state.lock().pools.insert(()))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock();
        state.pools.remove(pool);
        state.command_buffers.retain(|_, entry| entry.pool != pool);
    }

    fn create_fence(&self, name: &str, signaled: bool) -> Result<FenceHandle, RhiError> {
        Ok(self.state.lock().fences.insert(FenceEntry { name: name.to_owned(), signaled, pending: false }))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(fence);
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> Result<(), RhiError> {
        let mut state = self.state.lock();
        let entry = state.fences.get(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        if !entry.signaled {
            if !entry.pending {
                return Err(RhiError::FenceNeverSignaled(entry.name.clone()));
            }
            if state.stalled {
                return Err(match timeout {
                    Some(timeout) => RhiError::Timeout(timeout),
                    None => RhiError::DeviceLost,
                });
            }
            while state.fences.get(fence).is_some_and(|entry| !entry.signaled) {
                if state.complete_front().is_none() {
                    break;
                }
            }
        }
        state.events.push(DeviceEvent::FenceWaited { fence });
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), RhiError> {
        let mut state = self.state.lock();
        let entry = state.fences.get_mut(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        if entry.pending {
            return Err(RhiError::FenceInUse(entry.name.clone()));
        }
        entry.signaled = false;
        state.events.push(DeviceEvent::FenceReset { fence });
        Ok(())
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> Result<bool, RhiError> {
        let state = self.state.lock();
        let entry = state.fences.get(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        Ok(entry.signaled)
    }

    fn create_semaphore(&self, name: &str) -> Result<SemaphoreHandle, RhiError> {
        Ok(self.state.lock().semaphores.insert(SemaphoreEntry {
            name: name.to_owned(),
            signal: SemaphoreSignal::Unsignaled,
        }))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(semaphore);
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle, RhiError> {
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.extent.depth == 0 || desc.array_layers == 0 {
            return Err(RhiError::InvalidDescription(format!("texture \"{}\" has an empty extent", desc.name)));
        }
        if desc.dimension == TextureDimension::D3 && !self.config.features.texture_3d {
            return Err(RhiError::MissingFeature("texture_3d"));
        }
        Ok(self.state.lock().textures.insert(desc.clone()))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        self.state.lock().textures.remove(texture);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, RhiError> {
        if desc.size == 0 {
            return Err(RhiError::InvalidDescription(format!("buffer \"{}\" has size 0", desc.name)));
        }
        let data = match desc.location {
            MemoryLocation::Cpu => vec![0; desc.size as usize],
            MemoryLocation::Gpu => Vec::new(),
        };
        Ok(self.state.lock().buffers.insert(BufferEntry { desc: desc.clone(), data }))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(buffer);
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        let mut state = self.state.lock();
        let entry = state.buffers.get_mut(buffer).ok_or(RhiError::InvalidHandle("buffer"))?;
        if entry.desc.location != MemoryLocation::Cpu {
            return Err(RhiError::BufferNotHostVisible);
        }
        let end = offset.checked_add(data.len() as u64).filter(|end| *end <= entry.desc.size);
        let Some(end) = end else {
            return Err(RhiError::BufferWriteOutOfRange { offset, len: data.len(), size: entry.desc.size });
        };
        entry.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle, RhiError> {
        let empty_shader = match &desc.program {
            ShaderProgram::Graphics { vertex, fragment } => vertex.is_empty() || fragment.is_empty(),
            ShaderProgram::Compute(compute) => {
                if !self.config.features.compute {
                    return Err(RhiError::MissingFeature("compute"));
                }
                compute.is_empty()
            }
        };
        if empty_shader {
            return Err(RhiError::PipelineCreation {
                name: desc.name.clone(),
                reason: "empty shader binary".to_owned(),
            });
        }
        Ok(self.state.lock().pipelines.insert(desc.clone()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(pipeline);
    }

    fn create_command_buffer(&self, pool: CommandPoolHandle, commands: &CommandList) -> Result<CommandBufferHandle, RhiError> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(pool) {
            return Err(RhiError::InvalidHandle("command pool"));
        }
        state.validate_commands(commands)?;
        Ok(state.command_buffers.insert(CommandBufferEntry {
            pool,
            commands: commands.clone(),
            in_flight: 0,
        }))
    }

    fn free_command_buffer(&self, _pool: CommandPoolHandle, command_buffer: CommandBufferHandle) {
        let mut state = self.state.lock();
        if state.command_buffers.get(command_buffer).is_some_and(|entry| entry.in_flight > 0) {
            log::warn!("Freeing command buffer {command_buffer:?} while it is still in flight!");
        }
        state.command_buffers.remove(command_buffer);
    }

    fn submit(&self, queue: QueueHandle, info: &SubmitInfo<'_>) -> Result<(), RhiError> {
        if queue != self.graphics_queue() {
            return Err(RhiError::InvalidHandle("queue"));
        }
        let mut state = self.state.lock();

        for command_buffer in info.command_buffers {
            let entry = state.command_buffers.get(*command_buffer).ok_or(RhiError::InvalidHandle("command buffer"))?;
            if entry.in_flight > 0 {
                return Err(RhiError::CommandBufferInUse);
            }
        }
        if let Some(fence) = info.fence {
            let entry = state.fences.get(fence).ok_or(RhiError::InvalidHandle("fence"))?;
            if entry.signaled || entry.pending {
                return Err(RhiError::FenceInUse(entry.name.clone()));
            }
        }
        for semaphore in info.signal_semaphores {
            let entry = state.semaphores.get(*semaphore).ok_or(RhiError::InvalidHandle("semaphore"))?;
            if entry.signal != SemaphoreSignal::Unsignaled {
                return Err(RhiError::SemaphoreAlreadySignaled(entry.name.clone()));
            }
        }
        for semaphore in info.wait_semaphores {
            let entry = state.semaphores.get(*semaphore).ok_or(RhiError::InvalidHandle("semaphore"))?;
            if entry.signal == SemaphoreSignal::Unsignaled {
                return Err(RhiError::SemaphoreNotSignaled(entry.name.clone()));
            }
        }
        if let Some(err) = state.submit_faults.pop_front() {
            return Err(err);
        }

        for semaphore in info.wait_semaphores {
            state.consume_semaphore(*semaphore)?;
        }

        for command_buffer in info.command_buffers {
            if let Some(entry) = state.command_buffers.get_mut(*command_buffer) {
                entry.in_flight += 1;
            }
        }
        for semaphore in info.signal_semaphores {
            if let Some(entry) = state.semaphores.get_mut(*semaphore) {
                entry.signal = SemaphoreSignal::Pending;
            }
        }
        if let Some(fence) = info.fence {
            if let Some(entry) = state.fences.get_mut(fence) {
                entry.pending = true;
            }
        }

        let id = state.next_submission;
        state.next_submission += 1;
        state.queue.push_back(Submission {
            id,
            command_buffers: info.command_buffers.iter().copied().collect(),
            signal_semaphores: info.signal_semaphores.iter().copied().collect(),
            fence: info.fence,
        });
        let outstanding = state.outstanding_fences();
        state.max_outstanding_fences = state.max_outstanding_fences.max(outstanding);
        state.events.push(DeviceEvent::Submitted {
            submission: id,
            command_buffers: info.command_buffers.to_vec(),
            fence: info.fence,
        });
        trace!("headless: submitted {} ({} outstanding fences)", id, outstanding);
        Ok(())
    }

    fn wait_queue_idle(&self, queue: QueueHandle) -> Result<(), RhiError> {
        if queue != self.graphics_queue() {
            return Err(RhiError::InvalidHandle("queue"));
        }
        let mut state = self.state.lock();
        state.drain()?;
        state.events.push(DeviceEvent::QueueIdle);
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), RhiError> {
        let mut state = self.state.lock();
        state.drain()?;
        state.events.push(DeviceEvent::DeviceIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DrawParams;
    use crate::format::Format;

    fn recorded(device: &HeadlessDevice, pool: CommandPoolHandle) -> CommandBufferHandle {
        let mut list = CommandList::new("test");
        list.push(Command::Draw(DrawParams { vertex_count: 3, instance_count: 1, first_vertex: 0, first_instance: 0 }));
        device.create_command_buffer(pool, &list).unwrap()
    }

    #[test]
    fn fence_wait_completes_in_order() {
        let device = HeadlessDevice::default();
        let pool = device.create_command_pool(device.graphics_queue()).unwrap();
        let a = recorded(&device, pool);
        let b = recorded(&device, pool);
        let fa = device.create_fence("a", false).unwrap();
        let fb = device.create_fence("b", false).unwrap();

        let queue = device.graphics_queue();
        device.submit(queue, &SubmitInfo { command_buffers: &[a], fence: Some(fa), ..Default::default() }).unwrap();
        device.submit(queue, &SubmitInfo { command_buffers: &[b], fence: Some(fb), ..Default::default() }).unwrap();
        assert_eq!(device.outstanding_fences(), 2);

        device.wait_for_fence(fb, None).unwrap();
        assert!(device.is_fence_signaled(fa).unwrap());
        assert_eq!(device.outstanding_fences(), 0);
        assert_eq!(device.max_outstanding_fences(), 2);
    }

    #[test]
    fn resubmitting_in_flight_command_buffer_fails() {
        let device = HeadlessDevice::default();
        let pool = device.create_command_pool(device.graphics_queue()).unwrap();
        let cb = recorded(&device, pool);
        let queue = device.graphics_queue();

        device.submit(queue, &SubmitInfo { command_buffers: &[cb], ..Default::default() }).unwrap();
        let err = device.submit(queue, &SubmitInfo { command_buffers: &[cb], ..Default::default() });
        assert!(matches!(err, Err(RhiError::CommandBufferInUse)));

        device.wait_queue_idle(queue).unwrap();
        device.submit(queue, &SubmitInfo { command_buffers: &[cb], ..Default::default() }).unwrap();
    }

    #[test]
    fn waiting_on_unsubmitted_fence_is_reported() {
        let device = HeadlessDevice::default();
        let fence = device.create_fence("lonely", false).unwrap();
        assert!(matches!(device.wait_for_fence(fence, None), Err(RhiError::FenceNeverSignaled(name)) if name == "lonely"));
    }

    #[test]
    fn stalled_device_times_out() {
        let device = HeadlessDevice::default();
        let pool = device.create_command_pool(device.graphics_queue()).unwrap();
        let cb = recorded(&device, pool);
        let fence = device.create_fence("f", false).unwrap();
        device.submit(device.graphics_queue(), &SubmitInfo { command_buffers: &[cb], fence: Some(fence), ..Default::default() }).unwrap();

        device.set_stalled(true);
        let timeout = Duration::from_millis(5);
        assert!(matches!(device.wait_for_fence(fence, Some(timeout)), Err(RhiError::Timeout(t)) if t == timeout));
        assert!(matches!(device.wait_for_fence(fence, None), Err(RhiError::DeviceLost)));

        device.set_stalled(false);
        device.wait_for_fence(fence, None).unwrap();
    }

    #[test]
    fn semaphores_must_be_signalled_before_waiting() {
        let device = HeadlessDevice::default();
        let queue = device.graphics_queue();
        let semaphore = device.create_semaphore("s").unwrap();

        let err = device.submit(queue, &SubmitInfo { wait_semaphores: &[semaphore], ..Default::default() });
        assert!(matches!(err, Err(RhiError::SemaphoreNotSignaled(_))));

        device.submit(queue, &SubmitInfo { signal_semaphores: &[semaphore], ..Default::default() }).unwrap();
        device.consume_semaphores(&[semaphore]).unwrap();
        assert!(device.consume_semaphores(&[semaphore]).is_err());
    }

    #[test]
    fn waiting_on_a_pending_signal_takes_it_over() {
        let device = HeadlessDevice::default();
        let queue = device.graphics_queue();
        let semaphore = device.create_semaphore("render finished").unwrap();

        // present waits on the semaphore before the submission completed
        device.submit(queue, &SubmitInfo { signal_semaphores: &[semaphore], ..Default::default() }).unwrap();
        device.consume_semaphores(&[semaphore]).unwrap();
        device.wait_idle().unwrap();

        device.submit(queue, &SubmitInfo { signal_semaphores: &[semaphore], ..Default::default() }).unwrap();
        device.wait_idle().unwrap();
        device.consume_semaphores(&[semaphore]).unwrap();
    }

    #[test]
    fn failed_submit_leaves_its_sync_objects_alone() {
        let device = HeadlessDevice::default();
        let queue = device.graphics_queue();
        let pool = device.create_command_pool(queue).unwrap();
        let cb = recorded(&device, pool);
        let wait = device.create_semaphore("wait").unwrap();
        let fence = device.create_fence("f", false).unwrap();
        device.signal_external(None, Some(wait)).unwrap();

        device.fail_next_submit(RhiError::DeviceLost);
        let info = SubmitInfo { command_buffers: &[cb], wait_semaphores: &[wait], fence: Some(fence), ..Default::default() };
        assert!(matches!(device.submit(queue, &info), Err(RhiError::DeviceLost)));
        assert_eq!(device.pending_submissions(), 0);
        assert!(matches!(device.wait_for_fence(fence, None), Err(RhiError::FenceNeverSignaled(_))));

        device.submit(queue, &info).unwrap();
        device.wait_for_fence(fence, None).unwrap();
    }

    #[test]
    fn command_buffers_reject_dangling_handles() {
        let device = HeadlessDevice::default();
        let pool = device.create_command_pool(device.graphics_queue()).unwrap();
        let texture = device.create_texture(&TextureDesc::new_2d(4, 4, Format::Rgba8Unorm)).unwrap();
        device.destroy_texture(texture);

        let mut list = CommandList::new("dangling");
        list.push(Command::CopyTexture { src: texture, dst: texture, extent: Default::default() });
        assert!(matches!(device.create_command_buffer(pool, &list), Err(RhiError::InvalidHandle("texture"))));
    }

    #[test]
    fn cpu_buffers_are_writable() {
        let device = HeadlessDevice::default();
        let cpu = device.create_buffer(&BufferDesc::cpu("params", 8)).unwrap();
        let gpu = device.create_buffer(&BufferDesc::gpu("storage", 8)).unwrap();

        device.write_buffer(cpu, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.buffer_contents(cpu).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(matches!(device.write_buffer(cpu, 6, &[0; 4]), Err(RhiError::BufferWriteOutOfRange { .. })));
        assert!(matches!(device.write_buffer(gpu, 0, &[0]), Err(RhiError::BufferNotHostVisible)));
    }
}
