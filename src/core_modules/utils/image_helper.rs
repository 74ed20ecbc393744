pub mod image_helper {
    use crate::error::ColonyResult;
    use image::RgbaImage;
    use std::path::Path;

    /// Decodes any format the `image` crate understands into RGBA.
    pub fn load_rgba(path: &Path) -> ColonyResult<RgbaImage> {
        Ok(image::open(path)?.to_rgba8())
    }
}
