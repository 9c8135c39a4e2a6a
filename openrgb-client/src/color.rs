//! RGB colors

use std::fmt;

/// RGB color triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Self = Self { r: 0, g: 0, b: 0 };
    pub const WHITE: Self = Self {
        r: 255,
        g: 255,
        b: 255,
    };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Create from HSV (h: degrees, s and v in 0..=1).
    pub fn from_hsv(h: f32, s: f32, v: f32) -> Self {
        let h = h.rem_euclid(360.0);
        let s = s.clamp(0.0, 1.0);
        let v = v.clamp(0.0, 1.0);
        let chroma = v * s;
        let x = chroma * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
        let m = v - chroma;
        let (r, g, b) = match (h / 60.0) as u32 {
            0 => (chroma, x, 0.0),
            1 => (x, chroma, 0.0),
            2 => (0.0, chroma, x),
            3 => (0.0, x, chroma),
            4 => (x, 0.0, chroma),
            _ => (chroma, 0.0, x),
        };
        let channel = |c: f32| ((c + m) * 255.0).round() as u8;
        Self::new(channel(r), channel(g), channel(b))
    }

    /// Scale brightness by a factor clamped to [0, 1].
    pub fn scale(self, factor: f32) -> Self {
        let f = factor.clamp(0.0, 1.0);
        let channel = |c: u8| (f32::from(c) * f) as u8;
        Self::new(channel(self.r), channel(self.g), channel(self.b))
    }

    /// Linear interpolation, `t` clamped to [0, 1].
    pub fn lerp(a: Rgb, b: Rgb, t: f32) -> Rgb {
        let t = t.clamp(0.0, 1.0);
        let channel = |x: u8, y: u8| (f32::from(x) + (f32::from(y) - f32::from(x)) * t) as u8;
        Rgb::new(channel(a.r, b.r), channel(a.g, b.g), channel(a.b, b.b))
    }

    /// Parse `#RRGGBB`, `r,g,b` or a color name.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix('#') {
            if hex.len() != 6 || !hex.is_ascii() {
                return None;
            }
            let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
            return Some(Self::new(byte(0)?, byte(2)?, byte(4)?));
        }
        if s.contains(',') {
            let mut parts = s.split(',').map(|p| p.trim().parse::<u8>().ok());
            let color = Self::new(parts.next()??, parts.next()??, parts.next()??);
            return parts.next().is_none().then_some(color);
        }
        let named = match s.to_ascii_lowercase().as_str() {
            "black" | "off" => Self::BLACK,
            "white" => Self::WHITE,
            "red" => Self::new(255, 0, 0),
            "green" => Self::new(0, 255, 0),
            "blue" => Self::new(0, 0, 255),
            "yellow" => Self::new(255, 255, 0),
            "cyan" => Self::new(0, 255, 255),
            "magenta" | "pink" => Self::new(255, 0, 255),
            "orange" => Self::new(255, 165, 0),
            "purple" => Self::new(128, 0, 255),
            _ => return None,
        };
        Some(named)
    }

    /// OpenRGB wire form: r, g, b, padding
    pub fn to_wire(self) -> [u8; 4] {
        [self.r, self.g, self.b, 0]
    }

    pub fn from_wire(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl From<[u8; 3]> for Rgb {
    fn from(c: [u8; 3]) -> Self {
        Self::new(c[0], c[1], c[2])
    }
}
