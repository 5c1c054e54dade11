//! Surface configuration negotiation.
//!
//! The application asks for a sample count, a colour depth and a present mode. Whatever
//! the adapter cannot provide is replaced by a known-good default and reported as a
//! diagnostic; rendering always continues.

use log::warn;

use super::TextureFormat;

/// Colour precision of the default render target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorDepth {
    /// 8 bits per channel, sRGB encoded.
    #[default]
    Srgb8,
    /// 8 bits per channel, linear.
    Linear8,
    /// 16-bit floats per channel.
    HalfFloat,
}

impl ColorDepth {
    fn accepts(self, format: TextureFormat) -> bool {
        match self {
            ColorDepth::Srgb8 => matches!(
                format,
                TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb
            ),
            ColorDepth::Linear8 => matches!(
                format,
                TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm
            ),
            ColorDepth::HalfFloat => format == TextureFormat::Rgba16Float,
        }
    }
}

/// What the application would like the surface to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfacePreferences {
    pub sample_count: u32,
    pub color_depth: ColorDepth,
    pub vsync: bool,
}

impl Default for SurfacePreferences {
    fn default() -> Self {
        Self {
            sample_count: 1,
            color_depth: ColorDepth::Srgb8,
            vsync: true,
        }
    }
}

/// What the adapter offers for a surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceSupport {
    /// Supported formats in the adapter's order of preference. Never empty on a real adapter.
    pub formats: Vec<TextureFormat>,
    /// Sample counts usable with the chosen format.
    pub sample_counts: Vec<u32>,
    pub immediate_present: bool,
}

/// The configuration that will actually be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub format: TextureFormat,
    pub sample_count: u32,
    pub vsync: bool,
    /// One line per preference that had to be replaced.
    pub fallbacks: Vec<String>,
}

impl Negotiated {
    pub fn fell_back(&self) -> bool {
        !self.fallbacks.is_empty()
    }
}

/// The first of `formats` matching the preferred colour depth.
pub(crate) fn preferred_format(
    prefs: &SurfacePreferences,
    formats: &[TextureFormat],
) -> Option<TextureFormat> {
    formats.iter().copied().find(|f| prefs.color_depth.accepts(*f))
}

/// Picks a configuration, falling back to a safe default for anything unsupported.
pub fn negotiate(prefs: &SurfacePreferences, support: &SurfaceSupport) -> Negotiated {
    let mut fallbacks = Vec::new();

    let format = match preferred_format(prefs, &support.formats) {
        Some(format) => format,
        None => {
            let format = support
                .formats
                .first()
                .copied()
                .unwrap_or(TextureFormat::Rgba8UnormSrgb);
            fallbacks.push(format!(
                "colour depth {:?} unsupported, using {:?}",
                prefs.color_depth, format
            ));
            format
        }
    };

    let sample_count = if prefs.sample_count <= 1
        || support.sample_counts.contains(&prefs.sample_count)
    {
        prefs.sample_count.max(1)
    } else {
        fallbacks.push(format!(
            "{}x multisampling unsupported for {:?}, rendering without it",
            prefs.sample_count, format
        ));
        1
    };

    let vsync = if !prefs.vsync && !support.immediate_present {
        fallbacks.push("immediate presentation unsupported, keeping vsync".to_string());
        true
    } else {
        prefs.vsync
    };

    for diagnostic in &fallbacks {
        warn!("surface configuration fallback: {}", diagnostic);
    }

    Negotiated {
        format,
        sample_count,
        vsync,
        fallbacks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn support() -> SurfaceSupport {
        SurfaceSupport {
            formats: vec![TextureFormat::Bgra8UnormSrgb, TextureFormat::Bgra8Unorm],
            sample_counts: vec![1, 4],
            immediate_present: false,
        }
    }

    #[test]
    fn supported_preferences_are_kept() {
        let prefs = SurfacePreferences {
            sample_count: 4,
            ..Default::default()
        };
        let n = negotiate(&prefs, &support());
        assert_eq!(n.format, TextureFormat::Bgra8UnormSrgb);
        assert_eq!(n.sample_count, 4);
        assert!(!n.fell_back());
    }

    #[test]
    fn unsupported_multisampling_falls_back_to_one_sample() {
        let prefs = SurfacePreferences {
            sample_count: 8,
            ..Default::default()
        };
        let n = negotiate(&prefs, &support());
        assert_eq!(n.sample_count, 1);
        assert_eq!(n.fallbacks.len(), 1);
    }

    #[test]
    fn unsupported_colour_depth_uses_first_format() {
        let prefs = SurfacePreferences {
            color_depth: ColorDepth::HalfFloat,
            vsync: false,
            ..Default::default()
        };
        let n = negotiate(&prefs, &support());
        assert_eq!(n.format, TextureFormat::Bgra8UnormSrgb);
        assert!(n.vsync);
        assert_eq!(n.fallbacks.len(), 2);
    }
}
