/// Fixed color palette accepted by the canvas service, plus nearest-color
/// quantization for mapping arbitrary target-image pixels onto it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteColor {
    pub index: u8, // color index understood by the service
    pub rgb: Rgb,
    pub name: &'static str, // verbose name, for log output
}

/// The service's palette in index order. Order is load-bearing: quantization
/// ties break toward the earlier entry, so this table must stay stable.
const PALETTE_TABLE: &[(u8, u8, u8, &str)] = &[
    (0x6D, 0x00, 0x1A, "Burgundy"),
    (0xBE, 0x00, 0x39, "Dark Red"),
    (0xFF, 0x45, 0x00, "Bright Red"),
    (0xFF, 0xA8, 0x00, "Orange"),
    (0xFF, 0xD6, 0x35, "Yellow"),
    (0xFF, 0xF8, 0xB8, "Pale Yellow"),
    (0x00, 0xA3, 0x68, "Dark Green"),
    (0x00, 0xCC, 0x78, "Green"),
    (0x7E, 0xED, 0x56, "Light Green"),
    (0x00, 0x75, 0x6F, "Dark Teal"),
    (0x00, 0x9E, 0xAA, "Teal"),
    (0x00, 0xCC, 0xC0, "Light Teal"),
    (0x24, 0x50, 0xA4, "Dark Blue"),
    (0x36, 0x90, 0xEA, "Blue"),
    (0x51, 0xE9, 0xF4, "Cyan"),
    (0x49, 0x3A, 0xC1, "Indigo"),
    (0x6A, 0x5C, 0xFF, "Periwinkle"),
    (0x94, 0xB3, 0xFF, "Lavender"),
    (0x81, 0x1E, 0x9F, "Dark Purple"),
    (0xB4, 0x4A, 0xC0, "Purple"),
    (0xE4, 0xAB, 0xFF, "Pale Purple"),
    (0xDE, 0x10, 0x7F, "Magenta"),
    (0xFF, 0x38, 0x81, "Pink"),
    (0xFF, 0x99, 0xAA, "Light Pink"),
    (0x6D, 0x48, 0x2F, "Dark Brown"),
    (0x9C, 0x69, 0x26, "Brown"),
    (0xFF, 0xB4, 0x70, "Beige"),
    (0x00, 0x00, 0x00, "Black"),
    (0x51, 0x52, 0x52, "Dark Gray"),
    (0x89, 0x8D, 0x90, "Gray"),
    (0xD4, 0xD7, 0xD9, "Light Gray"),
    (0xFF, 0xFF, 0xFF, "White"),
];

#[derive(Debug, Clone)]
pub struct Palette {
    colors: Vec<PaletteColor>,
}

impl Palette {
    /// Build the standard service palette. Indices are assigned from table
    /// position, so they are unique by construction.
    pub fn standard() -> Self {
        let colors = PALETTE_TABLE
            .iter()
            .enumerate()
            .map(|(i, &(r, g, b, name))| PaletteColor {
                index: i as u8,
                rgb: Rgb::new(r, g, b),
                name,
            })
            .collect();
        Palette { colors }
    }

    #[cfg(test)]
    fn from_colors(colors: Vec<PaletteColor>) -> Self {
        Palette { colors }
    }

    /// Map an RGB value to the nearest palette entry by Euclidean distance.
    /// Squared distance preserves the argmin, so the sqrt is skipped. Ties go
    /// to the earlier table entry, which keeps the result deterministic.
    pub fn quantize(&self, rgb: Rgb) -> PaletteColor {
        let mut best = self.colors[0];
        let mut best_dist = distance_sq(rgb, best.rgb);
        for color in &self.colors[1..] {
            let dist = distance_sq(rgb, color.rgb);
            if dist < best_dist {
                best = *color;
                best_dist = dist;
            }
        }
        best
    }
}

fn distance_sq(a: Rgb, b: Rgb) -> u32 {
    let dr = a.r as i32 - b.r as i32;
    let dg = a.g as i32 - b.g as i32;
    let db = a.b as i32 - b.b as i32;
    (dr * dr + dg * dg + db * db) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_is_nonempty_with_unique_indices() {
        let palette = Palette::standard();
        assert_eq!(palette.colors.len(), 32);
        let mut seen = std::collections::HashSet::new();
        for color in &palette.colors {
            assert!(seen.insert(color.index), "duplicate index {}", color.index);
        }
    }

    #[test]
    fn quantize_is_identity_on_palette_members() {
        let palette = Palette::standard();
        for color in &palette.colors {
            let quantized = palette.quantize(color.rgb);
            assert_eq!(quantized, *color, "palette member {} moved", color.name);
        }
    }

    #[test]
    fn quantize_always_returns_a_palette_member() {
        let palette = Palette::standard();
        for rgb in [
            Rgb::new(0, 0, 0),
            Rgb::new(255, 255, 255),
            Rgb::new(128, 64, 192),
            Rgb::new(1, 2, 3),
            Rgb::new(254, 0, 127),
        ] {
            let quantized = palette.quantize(rgb);
            assert!(palette.colors.contains(&quantized));
        }
    }

    #[test]
    fn pure_red_maps_to_bright_red() {
        let palette = Palette::standard();
        let quantized = palette.quantize(Rgb::new(255, 0, 0));
        assert_eq!(quantized.name, "Bright Red");
    }

    #[test]
    fn ties_break_toward_the_earlier_entry() {
        // Two entries equidistant from the probe; the first one must win.
        let palette = Palette::from_colors(vec![
            PaletteColor {
                index: 0,
                rgb: Rgb::new(10, 0, 0),
                name: "first",
            },
            PaletteColor {
                index: 1,
                rgb: Rgb::new(30, 0, 0),
                name: "second",
            },
        ]);
        let quantized = palette.quantize(Rgb::new(20, 0, 0));
        assert_eq!(quantized.index, 0);
    }

    #[test]
    fn quantize_is_consistent() {
        let palette = Palette::standard();
        let a = palette.quantize(Rgb::new(128, 64, 192));
        let b = palette.quantize(Rgb::new(128, 64, 192));
        assert_eq!(a, b);
    }
}
