//! Chart request data model
//!
//! These types mirror the JSON bodies accepted by the routing layer. They are
//! assumed to be range-checked before they reach the pipeline; the only
//! structural invariants enforced here are the ones the type system can carry
//! (all ten classical bodies present, exactly twelve house cusps).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of one body on the ecliptic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planet {
    /// Longitude in degrees, `[0, 360)`
    pub lon: f64,
    /// Latitude in degrees, `[-90, 90]`
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub retrograde: bool,
}

impl Planet {
    pub fn at(lon: f64) -> Self {
        Self { lon, lat: 0.0, retrograde: false }
    }
}

/// Planet positions keyed by body name.
///
/// The ten classical bodies are required; the nodes and the two moons are
/// optional and omitted from the serialized form when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planets {
    pub sun: Planet,
    pub moon: Planet,
    pub mercury: Planet,
    pub venus: Planet,
    pub mars: Planet,
    pub jupiter: Planet,
    pub saturn: Planet,
    pub uranus: Planet,
    pub neptune: Planet,
    pub pluto: Planet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rahu: Option<Planet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ketu: Option<Planet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selena: Option<Planet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lilith: Option<Planet>,
}

/// One house cusp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HouseCusp {
    pub lon: f64,
}

/// The twelve house cusps of a wheel.
pub type Houses = [HouseCusp; 12];

/// A complete wheel: planets plus its own houses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wheel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub planets: Planets,
    pub houses: Houses,
}

/// An outer wheel whose houses may be borrowed from the inner one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OuterWheel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub planets: Planets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub houses: Option<Houses>,
    /// Moment the outer positions were computed for (transits)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStyle {
    Solid,
    Dashed,
    Dotted,
    None,
}

/// Visual and tolerance settings for one aspect type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectType {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_style: Option<LineStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
}

impl AspectType {
    pub fn enabled() -> Self {
        Self { enabled: true, orb: None, angle: None, color: None, line_style: None, stroke_width: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AspectTypes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conjunction: Option<AspectType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opposition: Option<AspectType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trine: Option<AspectType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square: Option<AspectType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sextile: Option<AspectType>,
}

impl AspectTypes {
    /// The five major aspects, all enabled.
    pub fn all_major() -> Self {
        Self {
            conjunction: Some(AspectType::enabled()),
            opposition: Some(AspectType::enabled()),
            trine: Some(AspectType::enabled()),
            square: Some(AspectType::enabled()),
            sextile: Some(AspectType::enabled()),
        }
    }
}

/// Aspect visibility for one wheel, or between two wheels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_orb")]
    pub orb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<AspectTypes>,
}

impl AspectSettings {
    pub fn new(enabled: bool, orb: f64) -> Self {
        Self { enabled, orb, types: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitAspectSettings {
    pub natal: Option<AspectSettings>,
    pub transit: Option<AspectSettings>,
    pub natal_to_transit: Option<AspectSettings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynastryHouses {
    #[default]
    Person1,
    Person2,
    /// Person 1's houses on the wheel, person 2's forwarded alongside
    Both,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynastryAspectSettings {
    pub person1: Option<AspectSettings>,
    pub person2: Option<AspectSettings>,
    pub interaspects: Option<AspectSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynastrySettings {
    #[serde(default)]
    pub use_houses_from: SynastryHouses,
    #[serde(default)]
    pub aspect_settings: Option<SynastryAspectSettings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiwheelHouses {
    #[default]
    Inner,
    Outer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiwheelAspectSettings {
    pub inner: Option<AspectSettings>,
    pub outer: Option<AspectSettings>,
    pub cross_aspects: Option<AspectSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiwheelSettings {
    #[serde(default)]
    pub use_houses_from: BiwheelHouses,
    #[serde(default)]
    pub aspect_settings: Option<BiwheelAspectSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatalChart {
    pub planets: Planets,
    pub houses: Houses,
    #[serde(default)]
    pub aspect_settings: Option<AspectSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitChart {
    pub natal: Wheel,
    pub transit: OuterWheel,
    #[serde(default)]
    pub aspect_settings: Option<TransitAspectSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynastryChart {
    pub person1: Wheel,
    pub person2: Wheel,
    #[serde(default)]
    pub synastry_settings: SynastrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiwheelChart {
    pub inner: Wheel,
    pub outer: OuterWheel,
    #[serde(default)]
    pub biwheel_settings: BiwheelSettings,
}

/// A validated chart request, tagged by `chartType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chartType", rename_all = "lowercase")]
pub enum ChartRequest {
    Natal(NatalChart),
    Transit(TransitChart),
    Synastry(SynastryChart),
    Biwheel(BiwheelChart),
}

impl ChartRequest {
    pub fn kind(&self) -> ChartKind {
        match self {
            ChartRequest::Natal(_) => ChartKind::Natal,
            ChartRequest::Transit(_) => ChartKind::Transit,
            ChartRequest::Synastry(_) => ChartKind::Synastry,
            ChartRequest::Biwheel(_) => ChartKind::Biwheel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Natal,
    Transit,
    Synastry,
    Biwheel,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Natal => "natal",
            ChartKind::Transit => "transit",
            ChartKind::Synastry => "synastry",
            ChartKind::Biwheel => "biwheel",
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Svg,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Svg => "svg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Svg => "image/svg+xml",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Svg => "svg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

/// Which labels the document template should draw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelVisibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person1_name: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person2_name: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legend: Option<bool>,
}

/// Output settings for one render. Missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderOptions {
    pub format: OutputFormat,
    /// Width in pixels (400..=2000)
    pub width: u32,
    /// Height in pixels (400..=2000)
    pub height: u32,
    /// JPEG quality (1..=100), ignored for PNG and SVG
    pub quality: u8,
    pub theme: Theme,
    pub show_houses: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_labels: Option<LabelVisibility>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            width: 800,
            height: 800,
            quality: 90,
            theme: Theme::Light,
            show_houses: true,
            show_labels: None,
        }
    }
}

/// Document template generation served to the browser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    #[default]
    V1,
    V2,
}

impl ApiVersion {
    pub fn template_name(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "chart.html",
            ApiVersion::V2 => "chart.v2.html",
        }
    }
}

/// A chart request together with its render options, as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(flatten)]
    pub chart: ChartRequest,
    #[serde(default)]
    pub render_options: RenderOptions,
}

fn default_true() -> bool {
    true
}

fn default_orb() -> f64 {
    6.0
}
