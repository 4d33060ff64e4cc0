use palette::{FromColor, Hsl, Srgb};

use crate::config::HUE_STEPS;

/// HSL to 8-bit sRGB. `degrees` wraps; saturation and lightness are clamped
/// to `[0, 1]`.
pub fn hsl_to_rgb(degrees: f32, saturation: f32, lightness: f32) -> (u8, u8, u8) {
    let hsl = Hsl::new(
        degrees.rem_euclid(360.0),
        saturation.clamp(0.0, 1.0),
        lightness.clamp(0.0, 1.0),
    );
    let rgb = Srgb::from_color(hsl).into_format::<u8>();
    (rgb.red, rgb.green, rgb.blue)
}

/// Colour sent to the accent ring for a stored hue step and brightness.
pub fn ring_rgb(hue: u8, brightness: u8) -> (u8, u8, u8) {
    let degrees = f32::from(hue % HUE_STEPS) * 360.0 / f32::from(HUE_STEPS);
    hsl_to_rgb(degrees, 1.0, f32::from(brightness) / 255.0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn primary_hues() {
        assert_eq!(hsl_to_rgb(0.0, 1.0, 0.5), (255, 0, 0));
        assert_eq!(hsl_to_rgb(120.0, 1.0, 0.5), (0, 255, 0));
        assert_eq!(hsl_to_rgb(240.0, 1.0, 0.5), (0, 0, 255));
        assert_eq!(hsl_to_rgb(360.0, 1.0, 0.5), (255, 0, 0));
    }

    #[test]
    fn lightness_extremes() {
        assert_eq!(hsl_to_rgb(151.0, 1.0, 0.0), (0, 0, 0));
        assert_eq!(hsl_to_rgb(151.0, 1.0, 1.0), (255, 255, 255));
        assert_eq!(hsl_to_rgb(151.0, 0.0, 0.5), (128, 128, 128));
    }

    #[test]
    fn ring_colour_follows_hue_steps() {
        assert_eq!(ring_rgb(0, 0), (0, 0, 0));
        assert_eq!(ring_rgb(100, 128), ring_rgb(0, 128));
        assert_eq!(ring_rgb(0, 255), (255, 255, 255));
        let (red, green, blue) = ring_rgb(HUE_STEPS / 3, 128);
        assert!(green > red && green > blue);
    }
}
