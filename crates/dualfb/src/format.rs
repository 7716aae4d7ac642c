/// Pixel layout shared by the canvas and every physical surface.
///
/// Only the storage size matters here; pixels are copied verbatim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit, one unused byte. The panels' native format.
    #[default]
    Xrgb8888,
    Rgb888,
    Rgb565,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }

    pub const fn bits_per_pixel(self) -> u32 {
        self.bytes_per_pixel() * 8
    }
}
