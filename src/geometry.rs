//! Static scene geometry: boundary point clouds and segmentation feature grids,
//! loaded once and shared read-only by the pooling modules and the scorers.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const BOUNDARY_FILE: &str = "world_points_boundary.txt";
pub const FEATURES_FILE: &str = "segmentation_features.json";

/// Dense per-cell features, `cells x channels`, row-major.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureGrid {
    pub cells: usize,
    pub channels: usize,
    pub values: Vec<f32>,
}

impl FeatureGrid {
    pub fn new(cells: usize, channels: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != cells * channels {
            return Err(Error::Shape {
                what: "feature grid",
                expected: vec![cells * channels],
                actual: vec![values.len()],
            });
        }
        Ok(Self {
            cells,
            channels,
            values,
        })
    }

    /// Builds a grid from one row of channel values per cell.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let cells = rows.len();
        let channels = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|row| row.len() != channels) {
            return Err(Error::Shape {
                what: "feature grid row",
                expected: vec![channels],
                actual: vec![bad.len()],
            });
        }
        Self::new(cells, channels, rows.into_iter().flatten().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.cells == 0 || self.channels == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SceneGeometry {
    pub boundary: Vec<[f32; 2]>,
    pub features: Option<FeatureGrid>,
}

impl SceneGeometry {
    pub fn points(boundary: Vec<[f32; 2]>) -> Self {
        Self {
            boundary,
            features: None,
        }
    }

    pub fn feature_grid(features: FeatureGrid) -> Self {
        Self {
            boundary: Vec::new(),
            features: Some(features),
        }
    }

    /// Keeps every `len / max_points`-th boundary point, at most `max_points`.
    pub fn downsampled(mut self, max_points: usize) -> Self {
        self.boundary = downsample(self.boundary, max_points);
        self
    }
}

pub fn downsample(points: Vec<[f32; 2]>, max_points: usize) -> Vec<[f32; 2]> {
    if max_points == 0 || points.len() <= max_points {
        return points;
    }
    let stride = points.len() / max_points;
    points
        .into_iter()
        .step_by(stride)
        .take(max_points)
        .collect()
}

/// Immutable scene-indexed geometry. Scene index `i` is the `i`-th scene name
/// in lexicographic order, matching the scene ids carried by batches.
#[derive(Debug, Clone, Default)]
pub struct SceneGeometryStore {
    scenes: Vec<(String, SceneGeometry)>,
}

impl SceneGeometryStore {
    pub fn new(entries: impl IntoIterator<Item = (String, SceneGeometry)>) -> Self {
        let mut scenes: Vec<(String, SceneGeometry)> = entries.into_iter().collect();
        scenes.sort_by(|a, b| a.0.cmp(&b.0));
        Self { scenes }
    }

    pub fn from_source(source: &dyn GeometrySource, down_samples: Option<usize>) -> Result<Self> {
        let names = source.scene_names()?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let mut geometry = source.load(&name)?;
            if let Some(max_points) = down_samples {
                geometry = geometry.downsampled(max_points);
            }
            debug!(
                scene = %name,
                points = geometry.boundary.len(),
                features = geometry.features.is_some(),
                "loaded scene geometry"
            );
            entries.push((name, geometry));
        }
        let store = Self::new(entries);
        info!(scenes = store.len(), "scene geometry store ready");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn get(&self, scene_idx: usize) -> Option<&SceneGeometry> {
        self.scenes.get(scene_idx).map(|(_, geometry)| geometry)
    }

    pub fn name(&self, scene_idx: usize) -> Option<&str> {
        self.scenes.get(scene_idx).map(|(name, _)| name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.scenes
            .binary_search_by(|(scene, _)| scene.as_str().cmp(name))
            .map_err(|_| Error::UnknownScene(name.to_string()))
    }

    /// Boundary points of a scene; unknown scenes have none.
    pub fn boundary(&self, scene_idx: usize) -> &[[f32; 2]] {
        self.get(scene_idx)
            .map(|geometry| geometry.boundary.as_slice())
            .unwrap_or(&[])
    }

    pub fn features(&self, scene_idx: usize) -> Option<&FeatureGrid> {
        self.get(scene_idx)
            .and_then(|geometry| geometry.features.as_ref())
    }
}

/// Supplies raw geometry per scene name.
pub trait GeometrySource {
    fn scene_names(&self) -> Result<Vec<String>>;
    fn load(&self, scene: &str) -> Result<SceneGeometry>;
}

/// Reads `<root>/<scene>/world_points_boundary.txt` and
/// `<root>/<scene>/segmentation_features.json`; either file may be absent.
#[derive(Debug, Clone)]
pub struct DirectoryGeometrySource {
    root: PathBuf,
}

impl DirectoryGeometrySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl GeometrySource for DirectoryGeometrySource {
    fn scene_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, scene: &str) -> Result<SceneGeometry> {
        let dir = self.root.join(scene);
        if !dir.is_dir() {
            return Err(Error::UnknownScene(scene.to_string()));
        }

        let boundary_path = dir.join(BOUNDARY_FILE);
        let boundary = if boundary_path.exists() {
            parse_points(&boundary_path, &fs::read_to_string(&boundary_path)?)?
        } else {
            Vec::new()
        };

        let features_path = dir.join(FEATURES_FILE);
        let features = if features_path.exists() {
            let rows: Vec<Vec<f32>> = serde_json::from_str(&fs::read_to_string(&features_path)?)?;
            Some(FeatureGrid::from_rows(rows).map_err(|err| Error::Geometry {
                path: features_path.clone(),
                reason: err.to_string(),
            })?)
        } else {
            None
        };

        Ok(SceneGeometry { boundary, features })
    }
}

/// Parses whitespace separated `x y` lines; blank lines and `#` comments are skipped.
pub fn parse_points(path: &Path, contents: &str) -> Result<Vec<[f32; 2]>> {
    let mut points = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values: Vec<&str> = line.split_whitespace().collect();
        let malformed = || Error::Geometry {
            path: path.to_path_buf(),
            reason: format!("line {}: expected `x y`, got `{line}`", line_no + 1),
        };
        if values.len() != 2 {
            return Err(malformed());
        }
        let x: f32 = values[0].parse().map_err(|_| malformed())?;
        let y: f32 = values[1].parse().map_err(|_| malformed())?;
        if !x.is_finite() || !y.is_finite() {
            return Err(malformed());
        }
        points.push([x, y]);
    }
    Ok(points)
}
