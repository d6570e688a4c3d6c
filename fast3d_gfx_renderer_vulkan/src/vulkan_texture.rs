/// TextureTable - texture ids handed to the interpreter and their images
///
/// Ids are slotmap keys packed into the opaque `TextureId`, so a stale id
/// (deleted texture) is detected instead of aliasing a newer texture.

use fast3d_gfx::fast3d::render::TextureId;
use slotmap::{new_key_type, Key, KeyData, SlotMap};

use crate::vulkan_driver::GpuImage;

new_key_type! {
    /// Slot of one texture
    pub struct TextureKey;
}

impl From<TextureKey> for TextureId {
    fn from(key: TextureKey) -> Self {
        TextureId::from_raw(key.data().as_ffi())
    }
}

impl From<TextureId> for TextureKey {
    fn from(id: TextureId) -> Self {
        KeyData::from_ffi(id.raw()).into()
    }
}

/// Texture ids with an optional image (none until first upload)
#[derive(Debug, Default)]
pub struct TextureTable {
    textures: SlotMap<TextureKey, Option<GpuImage>>,
}

impl TextureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> TextureId {
        self.textures.insert(None).into()
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.textures.contains_key(TextureKey::from(id))
    }

    pub fn image(&self, id: TextureId) -> Option<&GpuImage> {
        self.textures.get(TextureKey::from(id)).and_then(|slot| slot.as_ref())
    }

    /// Install a new image for an id, returning the image it replaces
    pub fn replace(&mut self, id: TextureId, image: GpuImage) -> Result<Option<GpuImage>, GpuImage> {
        match self.textures.get_mut(TextureKey::from(id)) {
            Some(slot) => Ok(slot.replace(image)),
            None => Err(image),
        }
    }

    /// Free an id, returning its image if one was uploaded
    pub fn remove(&mut self, id: TextureId) -> Option<GpuImage> {
        self.textures.remove(TextureKey::from(id)).flatten()
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    /// Empty the table, returning every uploaded image
    pub fn drain(&mut self) -> Vec<GpuImage> {
        self.textures.drain().filter_map(|(_, image)| image).collect()
    }
}

#[cfg(test)]
#[path = "vulkan_texture_tests.rs"]
mod tests;
