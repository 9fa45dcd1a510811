//! Typed pass descriptors and the executor that runs them.
//!
//! A frame is a sequence of [`PassDescriptor`]s. Each one names the render
//! target to bind, an optional clear, the technique with its parameter
//! bindings, and the draw to issue; [`execute`] performs those steps in
//! that order against any [`RenderBackend`].

use tracing::trace;

use crate::backend::{
    ClearValues, DrawCall, ParamValue, RenderBackend, RenderTargetId, TechniqueId, Topology,
};
use crate::error::FrameError;

/// Everything needed to run one draw.
#[derive(Debug, Clone)]
pub struct PassDescriptor {
    /// Name for logs.
    pub name: &'static str,
    /// Render target to bind; `None` is the backbuffer.
    pub target: Option<RenderTargetId>,
    /// Clear applied after binding; `None` keeps the target's contents.
    pub clear: Option<ClearValues>,
    pub technique: TechniqueId,
    /// Named parameters bound before the draw.
    pub inputs: Vec<(&'static str, ParamValue)>,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub topology: Topology,
}

impl PassDescriptor {
    /// Pass drawing `vertex_count` vertices once, with no target switch or clear.
    pub fn new(
        name: &'static str,
        target: Option<RenderTargetId>,
        technique: TechniqueId,
        vertex_count: u32,
        topology: Topology,
    ) -> Self {
        Self {
            name,
            target,
            clear: None,
            technique,
            inputs: Vec::new(),
            vertex_count,
            instance_count: 1,
            topology,
        }
    }

    pub fn clear(mut self, values: ClearValues) -> Self {
        self.clear = Some(values);
        self
    }

    pub fn input(mut self, name: &'static str, value: impl Into<ParamValue>) -> Self {
        self.inputs.push((name, value.into()));
        self
    }

    pub fn instances(mut self, count: u32) -> Self {
        self.instance_count = count;
        self
    }

    fn draw_call(&self) -> DrawCall {
        DrawCall {
            technique: self.technique,
            vertex_count: self.vertex_count,
            instance_count: self.instance_count,
            topology: self.topology,
        }
    }
}

/// Bind, clear, set inputs, draw.
pub fn execute<B: RenderBackend + ?Sized>(
    backend: &mut B,
    pass: &PassDescriptor,
) -> Result<(), FrameError> {
    backend.bind_render_target(pass.target)?;
    if let Some(clear) = &pass.clear {
        backend.clear(clear)?;
    }
    for (name, value) in &pass.inputs {
        backend.set_param(pass.technique, name, *value)?;
    }
    backend.draw(&pass.draw_call())?;
    trace!(
        target: "pipeline",
        pass = pass.name,
        vertices = pass.vertex_count,
        instances = pass.instance_count,
        "pass executed"
    );
    Ok(())
}
