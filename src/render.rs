//! Rendering boundary.
//!
//! The overlay is external; the core only turns a territory snapshot into
//! per-layer [`RenderElement`]s and pushes them through a [`Renderer`].
//! Nothing flows back from rendering into the marker records.

use crate::config::DisplayConfig;
use crate::marker::{Marker, MarkerConfig};
use crate::types::{MarkerKind, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    /// Permanent markers.
    TrapHoard,
    /// Transient coffers currently in view.
    RegularCoffers,
}

impl Layer {
    pub fn for_kind(kind: MarkerKind) -> Layer {
        if kind.is_permanent() {
            Layer::TrapHoard
        } else {
            Layer::RegularCoffers
        }
    }
}

/// A circle the overlay should draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderElement {
    pub kind: MarkerKind,
    /// Marker position with the kind's vertical offset applied.
    pub position: Vec3,
    pub radius: f32,
    pub color: u32,
    pub fill: bool,
}

pub trait Renderer {
    fn set_layer(&mut self, layer: Layer, elements: Vec<RenderElement>);
    fn reset_layer(&mut self, layer: Layer);
}

pub fn create_element(kind: MarkerKind, position: Vec3, color: u32, fill: bool) -> RenderElement {
    let config = MarkerConfig::for_kind(kind);
    RenderElement {
        kind,
        position: Vec3::new(position.x, position.y + config.offset_y, position.z),
        radius: config.radius,
        color,
        fill,
    }
}

/// Elements for each layer, in snapshot order. Layers with nothing to show
/// are still returned, empty.
pub fn build_layers(markers: &[Marker], display: &DisplayConfig) -> Vec<(Layer, Vec<RenderElement>)> {
    let mut trap_hoard = Vec::new();
    let mut coffers = Vec::new();

    for marker in markers {
        let Some(settings) = display.for_kind(marker.kind) else {
            continue;
        };
        if !settings.show {
            continue;
        }
        if settings.only_visible_after_pull && !marker.is_seen_anywhere() {
            continue;
        }

        let element = create_element(marker.kind, marker.position, settings.color, settings.fill);
        match Layer::for_kind(marker.kind) {
            Layer::TrapHoard => trap_hoard.push(element),
            Layer::RegularCoffers => coffers.push(element),
        }
    }

    vec![
        (Layer::TrapHoard, trap_hoard),
        (Layer::RegularCoffers, coffers),
    ]
}

/// Replace every layer on `renderer` with what `markers` should look like.
pub fn draw(renderer: &mut dyn Renderer, markers: &[Marker], display: &DisplayConfig) {
    for (layer, elements) in build_layers(markers, display) {
        if elements.is_empty() {
            renderer.reset_layer(layer);
        } else {
            renderer.set_layer(layer, elements);
        }
    }
}
