//! Viewport-sized render targets.

use tracing::debug;

use crate::backend::{PixelFormat, RenderBackend, RenderTargetDesc, RenderTargetId, TextureDesc, TextureId};
use crate::error::AllocationError;

/// Format of the scene and fog color captures.
pub const CAPTURE_FORMAT: PixelFormat = PixelFormat::Rgba16Float;

/// Scene and fog targets sized to the viewport.
///
/// Both targets share one depth attachment: the terrain writes depth into
/// the scene target and the particle pass tests against it while drawing
/// into the fog target.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetSet {
    width: u32,
    height: u32,
    scene_color: TextureId,
    fog_color: TextureId,
    depth: TextureId,
    scene: RenderTargetId,
    fog: RenderTargetId,
}

impl RenderTargetSet {
    /// Allocate every attachment at `width x height`.
    ///
    /// On failure whatever was already allocated is released again, so the
    /// backend is left as it was.
    pub fn create<B: RenderBackend + ?Sized>(
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> Result<Self, AllocationError> {
        let mut textures = Vec::with_capacity(3);
        let result = Self::allocate(backend, width, height, &mut textures);
        if result.is_err() {
            for texture in textures {
                backend.release_texture(texture);
            }
        }
        result
    }

    fn allocate<B: RenderBackend + ?Sized>(
        backend: &mut B,
        width: u32,
        height: u32,
        textures: &mut Vec<TextureId>,
    ) -> Result<Self, AllocationError> {
        let mut texture = |backend: &mut B,
                           label: &str,
                           format: PixelFormat|
         -> Result<TextureId, AllocationError> {
            let id = backend.create_texture(&TextureDesc::d2(label, width, height, format))?;
            textures.push(id);
            Ok(id)
        };
        let scene_color = texture(backend, "scene_color", CAPTURE_FORMAT)?;
        let fog_color = texture(backend, "fog_color", CAPTURE_FORMAT)?;
        let depth = texture(backend, "scene_depth", PixelFormat::Depth32Float)?;

        let scene = backend.create_render_target(&RenderTargetDesc {
            label: "scene".to_string(),
            colors: vec![scene_color],
            depth: Some(depth),
        })?;
        let fog = match backend.create_render_target(&RenderTargetDesc {
            label: "fog".to_string(),
            colors: vec![fog_color],
            depth: Some(depth),
        }) {
            Ok(fog) => fog,
            Err(err) => {
                backend.release_render_target(scene);
                return Err(err);
            }
        };

        debug!(target: "pipeline", width, height, "render targets created");
        Ok(Self {
            width,
            height,
            scene_color,
            fog_color,
            depth,
            scene,
            fog,
        })
    }

    /// Build a set at the new size; `self` is only released once that succeeds.
    pub fn resize<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> Result<(), AllocationError> {
        let new = Self::create(backend, width, height)?;
        let old = std::mem::replace(self, new);
        old.release(backend);
        Ok(())
    }

    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        backend.release_render_target(self.scene);
        backend.release_render_target(self.fog);
        for texture in self.textures() {
            backend.release_texture(texture);
        }
    }

    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Target holding the terrain color and depth.
    #[inline]
    pub fn scene(&self) -> RenderTargetId {
        self.scene
    }

    /// Target the particles are drawn into.
    #[inline]
    pub fn fog(&self) -> RenderTargetId {
        self.fog
    }

    #[inline]
    pub fn scene_color(&self) -> TextureId {
        self.scene_color
    }

    #[inline]
    pub fn fog_color(&self) -> TextureId {
        self.fog_color
    }

    #[inline]
    pub fn depth(&self) -> TextureId {
        self.depth
    }

    /// Every texture the set owns.
    pub fn textures(&self) -> [TextureId; 3] {
        [self.scene_color, self.fog_color, self.depth]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn test_create_sizes_every_attachment() {
        let mut backend = SoftwareBackend::new(64, 48);
        let set = RenderTargetSet::create(&mut backend, 64, 48).unwrap();
        for texture in set.textures() {
            assert_eq!(backend.texture_size(texture), Some((64, 48, 1)));
        }
        assert_eq!(backend.live_textures(), 3);
        assert_eq!(backend.live_render_targets(), 2);
    }

    #[test]
    fn test_failed_create_releases_partial_allocation() {
        let mut backend = SoftwareBackend::new(64, 48).with_texture_budget(2);
        assert!(RenderTargetSet::create(&mut backend, 64, 48).is_err());
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_render_targets(), 0);
    }

    #[test]
    fn test_unrenderable_capture_format() {
        let mut backend = SoftwareBackend::new(64, 48).with_unsupported_format(CAPTURE_FORMAT);
        let err = RenderTargetSet::create(&mut backend, 64, 48).unwrap_err();
        assert!(matches!(err, AllocationError::RenderTarget { .. }));
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_resize_replaces_attachments() {
        let mut backend = SoftwareBackend::new(64, 48);
        let mut set = RenderTargetSet::create(&mut backend, 64, 48).unwrap();
        let old = set.textures();
        set.resize(&mut backend, 32, 16).unwrap();

        assert_eq!(set.size(), (32, 16));
        for texture in old {
            assert_eq!(backend.texture_size(texture), None);
        }
        for texture in set.textures() {
            assert_eq!(backend.texture_size(texture), Some((32, 16, 1)));
        }
        assert_eq!(backend.live_textures(), 3);
        assert_eq!(backend.live_render_targets(), 2);
    }

    #[test]
    fn test_failed_resize_keeps_old_set() {
        let mut backend = SoftwareBackend::new(64, 48).with_texture_budget(4);
        let mut set = RenderTargetSet::create(&mut backend, 64, 48).unwrap();
        let before = set.clone();
        assert!(set.resize(&mut backend, 32, 16).is_err());
        assert_eq!(set, before);
        assert_eq!(backend.live_textures(), 3);
    }
}
