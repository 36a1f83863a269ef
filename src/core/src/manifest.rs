//! The `slice.json` archive manifest.
//!
//! First entry of every produced archive; the consuming controller reads it
//! before touching any layer image. Field names are a wire contract, so the
//! structs below serialize exactly as written and tests pin the shape.

use crate::area::AreaStats;
use crate::error::{Error, Result};
use crate::profile::TargetProfile;
use crate::reader::SliceFile;

/// Per-layer record in the manifest's `layers` array.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerRecord {
    pub index: u32,
    pub z_mm: f32,
    pub area_mm2: f64,
    pub island_count: u32,
    /// `[min_x, min_y, max_x, max_y]` over solid pixels; zeros when empty.
    pub bbox: [u32; 4],
}

/// Archive-level metadata, serialized as `slice.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub layer_count: u32,
    pub layer_height_mm: f32,
    pub bottom_layer_count: u32,
    pub exposure_s: f32,
    pub bottom_exposure_s: f32,
    pub lift_height_mm: f32,
    pub print_height_mm: f32,
    pub profile_label: String,
    pub layers: Vec<LayerRecord>,
}

impl Manifest {
    /// Seed a manifest from the parsed source and the target profile; layer
    /// records are appended as the pipeline finishes them.
    pub fn new(slice: &SliceFile, profile: &TargetProfile) -> Manifest {
        let (resolution_x, resolution_y) = slice.resolution();
        Manifest {
            resolution_x,
            resolution_y,
            layer_count: slice.layer_count(),
            layer_height_mm: slice.layer_height_mm(),
            bottom_layer_count: slice.bottom_layer_count(),
            exposure_s: slice.exposure_s(),
            bottom_exposure_s: slice.bottom_exposure_s(),
            lift_height_mm: slice.lift_height_mm(),
            print_height_mm: slice.print_height_mm(),
            profile_label: profile.label.clone(),
            layers: Vec::with_capacity(slice.layer_count() as usize),
        }
    }

    /// Append the record for one finished layer. Must be called in
    /// ascending layer order; the pipeline's ordered sink guarantees it.
    pub fn push_layer(&mut self, index: u32, z_mm: f32, stats: &AreaStats) {
        debug_assert_eq!(index as usize, self.layers.len());
        self.layers.push(LayerRecord {
            index,
            z_mm,
            area_mm2: stats.total_mm2,
            island_count: stats.island_count,
            bbox: [
                stats.bbox.min_x,
                stats.bbox.min_y,
                stats.bbox.max_x,
                stats.bbox.max_y,
            ],
        });
    }

    /// Serialize to the UTF-8 JSON bytes stored in the archive.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidFormat(format!("manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_the_contract_field_names() {
        let manifest = Manifest {
            resolution_x: 3840,
            resolution_y: 2160,
            layer_count: 2,
            layer_height_mm: 0.05,
            bottom_layer_count: 4,
            exposure_s: 2.0,
            bottom_exposure_s: 30.0,
            lift_height_mm: 6.0,
            print_height_mm: 0.1,
            profile_label: "mono-4k".into(),
            layers: vec![LayerRecord {
                index: 0,
                z_mm: 0.05,
                area_mm2: 12.5,
                island_count: 1,
                bbox: [100, 100, 200, 200],
            }],
        };
        let json: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["resolution_x"], 3840);
        assert_eq!(json["layer_count"], 2);
        assert_eq!(json["profile_label"], "mono-4k");
        assert_eq!(json["layers"][0]["index"], 0);
        assert_eq!(json["layers"][0]["island_count"], 1);
        assert_eq!(json["layers"][0]["bbox"][2], 200);
    }
}
