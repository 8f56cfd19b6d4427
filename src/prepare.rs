//! Template/config preparation
//!
//! Pure transforms that turn a [`ChartRequest`] into the single configuration
//! object the rendering library consumes, and splice that object (and,
//! optionally, the library bundle itself) into the document template.

use crate::chart::{
    AspectSettings, AspectTypes, BiwheelHouses, ChartKind, ChartRequest, Houses, OuterWheel, Planets,
    RenderOptions, SynastryHouses, Wheel,
};
use crate::{Error, Result};
use log::warn;
use serde::Serialize;

/// Token the document template carries where the chart configuration goes.
pub const CONFIG_PLACEHOLDER: &str = "/* CHART_CONFIG_PLACEHOLDER */";

/// Token replaced by an inline `<script>` holding the rendering library.
pub const LIBRARY_PLACEHOLDER: &str = "<!-- CHART_LIBRARY -->";

/// Orb used for a single wheel's aspects when the request gives none.
pub const DEFAULT_ORB: f64 = 6.0;

/// Orb used for aspects between two wheels when the request gives none.
pub const DEFAULT_CROSS_ORB: f64 = 3.0;

/// One wheel as handed to the rendering library.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WheelConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub planets: Planets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
}

impl WheelConfig {
    fn from_wheel(wheel: &Wheel) -> Self {
        Self { name: wheel.name.clone(), planets: wheel.planets.clone(), datetime: None }
    }

    fn from_outer(wheel: &OuterWheel) -> Self {
        Self {
            name: wheel.name.clone(),
            planets: wheel.planets.clone(),
            datetime: wheel.datetime.clone(),
        }
    }
}

/// Normalized chart configuration, identical in shape for every chart kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub chart_type: ChartKind,
    pub primary_wheel: WheelConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_wheel: Option<WheelConfig>,
    pub houses: Houses,
    /// Outer wheel houses, forwarded only when both sets were requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_houses: Option<Houses>,
    pub primary_aspect_settings: AspectSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_aspect_settings: Option<AspectSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_aspect_settings: Option<AspectSettings>,
    pub render_options: RenderOptions,
}

fn natal_default() -> AspectSettings {
    AspectSettings { enabled: true, orb: DEFAULT_ORB, types: Some(AspectTypes::all_major()) }
}

fn primary_or_default(settings: Option<&AspectSettings>) -> AspectSettings {
    settings.cloned().unwrap_or_else(|| AspectSettings::new(true, DEFAULT_ORB))
}

fn secondary_or_default(settings: Option<&AspectSettings>) -> AspectSettings {
    settings.cloned().unwrap_or_else(|| AspectSettings::new(false, DEFAULT_ORB))
}

fn cross_or_default(settings: Option<&AspectSettings>) -> AspectSettings {
    settings.cloned().unwrap_or_else(|| AspectSettings::new(true, DEFAULT_CROSS_ORB))
}

/// Normalize any chart kind into a [`ChartConfig`].
///
/// Multi-wheel charts take the primary (inner) wheel's houses unless the
/// request explicitly selects the secondary wheel's.
pub fn prepare_config(request: &ChartRequest, options: &RenderOptions) -> ChartConfig {
    let render_options = options.clone();
    match request {
        ChartRequest::Natal(chart) => ChartConfig {
            chart_type: ChartKind::Natal,
            primary_wheel: WheelConfig { name: None, planets: chart.planets.clone(), datetime: None },
            secondary_wheel: None,
            houses: chart.houses,
            secondary_houses: None,
            primary_aspect_settings: chart.aspect_settings.clone().unwrap_or_else(natal_default),
            secondary_aspect_settings: None,
            cross_aspect_settings: None,
            render_options,
        },
        ChartRequest::Transit(chart) => {
            let aspects = chart.aspect_settings.clone().unwrap_or_default();
            ChartConfig {
                chart_type: ChartKind::Transit,
                primary_wheel: WheelConfig::from_wheel(&chart.natal),
                secondary_wheel: Some(WheelConfig::from_outer(&chart.transit)),
                houses: chart.natal.houses,
                secondary_houses: None,
                primary_aspect_settings: primary_or_default(aspects.natal.as_ref()),
                secondary_aspect_settings: Some(secondary_or_default(aspects.transit.as_ref())),
                cross_aspect_settings: Some(cross_or_default(aspects.natal_to_transit.as_ref())),
                render_options,
            }
        }
        ChartRequest::Synastry(chart) => {
            let settings = &chart.synastry_settings;
            let aspects = settings.aspect_settings.clone().unwrap_or_default();
            let (houses, secondary_houses) = match settings.use_houses_from {
                SynastryHouses::Person1 => (chart.person1.houses, None),
                SynastryHouses::Person2 => (chart.person2.houses, None),
                SynastryHouses::Both => (chart.person1.houses, Some(chart.person2.houses)),
            };
            ChartConfig {
                chart_type: ChartKind::Synastry,
                primary_wheel: WheelConfig::from_wheel(&chart.person1),
                secondary_wheel: Some(WheelConfig::from_wheel(&chart.person2)),
                houses,
                secondary_houses,
                primary_aspect_settings: primary_or_default(aspects.person1.as_ref()),
                secondary_aspect_settings: Some(secondary_or_default(aspects.person2.as_ref())),
                cross_aspect_settings: Some(cross_or_default(aspects.interaspects.as_ref())),
                render_options,
            }
        }
        ChartRequest::Biwheel(chart) => {
            let settings = &chart.biwheel_settings;
            let aspects = settings.aspect_settings.clone().unwrap_or_default();
            let houses = match (settings.use_houses_from, chart.outer.houses) {
                (BiwheelHouses::Outer, Some(outer)) => outer,
                (BiwheelHouses::Outer, None) => {
                    warn!("Biwheel requested outer houses but outer wheel has none; using inner houses");
                    chart.inner.houses
                }
                (BiwheelHouses::Inner, _) => chart.inner.houses,
            };
            ChartConfig {
                chart_type: ChartKind::Biwheel,
                primary_wheel: WheelConfig::from_wheel(&chart.inner),
                secondary_wheel: Some(WheelConfig::from_outer(&chart.outer)),
                houses,
                secondary_houses: None,
                primary_aspect_settings: primary_or_default(aspects.inner.as_ref()),
                secondary_aspect_settings: Some(secondary_or_default(aspects.outer.as_ref())),
                cross_aspect_settings: Some(cross_or_default(aspects.cross_aspects.as_ref())),
                render_options,
            }
        }
    }
}

/// Replace the config placeholder in `document` with a `chartConfig` literal.
///
/// The template must carry the placeholder exactly once. An already-injected
/// document no longer has it and is rejected, as is a corrupted template.
pub fn inject_config(document: &str, config: &ChartConfig) -> Result<String> {
    match document.matches(CONFIG_PLACEHOLDER).count() {
        0 => {
            return Err(Error::Template(format!(
                "config placeholder `{}` not found in document",
                CONFIG_PLACEHOLDER
            )))
        }
        1 => {}
        n => {
            return Err(Error::Template(format!(
                "config placeholder `{}` appears {} times in document",
                CONFIG_PLACEHOLDER, n
            )))
        }
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| Error::Template(format!("Failed to serialize chart config: {}", e)))?;
    let literal = format!("const chartConfig = {};", escape_for_script(&json));
    Ok(document.replacen(CONFIG_PLACEHOLDER, &literal, 1))
}

/// Rewrite markup-significant characters as JSON `\u` escapes so free-text
/// names can neither end the surrounding `<script>` nor open a comment or
/// nested script inside it. These characters only occur inside JSON strings,
/// where the escapes decode back to the same text.
fn escape_for_script(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Inline the rendering library bundle at the library placeholder.
///
/// Returns `None` when the template has no placeholder, meaning it references
/// the bundle by URL and expects the content server to serve it.
pub fn inline_library(document: &str, bundle: &str) -> Option<String> {
    if !document.contains(LIBRARY_PLACEHOLDER) {
        return None;
    }
    let script = format!("<script>\n{}\n</script>", bundle.replace("</script", "<\\/script"));
    Some(document.replacen(LIBRARY_PLACEHOLDER, &script, 1))
}

/// Point the library placeholder at a bundle served next to the document.
///
/// Returns `None` when the template has no placeholder.
pub fn reference_library(document: &str, src: &str) -> Option<String> {
    if !document.contains(LIBRARY_PLACEHOLDER) {
        return None;
    }
    let script = format!("<script src=\"{}\"></script>", src.replace('"', "%22"));
    Some(document.replacen(LIBRARY_PLACEHOLDER, &script, 1))
}
