use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration of the splined-stereographic model.
///
/// The focal-length scalings are two independent `nx` x `ny` grids of cubic
/// B-spline control points laid out over the stereographic projection of the
/// declared horizontal field of view. `cx`/`cy` are fixed; they are part of
/// the configuration, not of the optimization state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplinedConfig {
    pub order: u16,
    pub nx: u16,
    pub ny: u16,
    pub fov_x_deg: f64,
    pub cx: f64,
    pub cy: f64,
}

impl SplinedConfig {
    pub fn n_params(&self) -> usize {
        // one surface for fx, another for fy
        self.nx as usize * self.ny as usize * 2
    }

    fn parse(tail: &str) -> Option<SplinedConfig> {
        let mut it = tail.split('_');
        let config = SplinedConfig {
            order: it.next()?.parse().ok()?,
            nx: it.next()?.parse().ok()?,
            ny: it.next()?.parse().ok()?,
            fov_x_deg: it.next()?.parse().ok()?,
            cx: it.next()?.parse().ok()?,
            cy: it.next()?.parse().ok()?,
        };
        // the whole tail must be consumed
        if it.next().is_some() {
            return None;
        }
        if config.order != 3 || config.nx < 4 || config.ny < 4 {
            return None;
        }
        Some(config)
    }
}

impl fmt::Display for SplinedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // {:?} keeps a decimal point on round floats, so names always
        // re-parse to the same configuration
        write!(
            f,
            "{}_{}_{}_{:?}_{:?}_{:?}",
            self.order, self.nx, self.ny, self.fov_x_deg, self.cx, self.cy
        )
    }
}

/// A supported lens model.
///
/// Every variant has a fixed parameter count except
/// [LensModel::SplinedStereographic], whose count follows its grid
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LensModel {
    Pinhole,
    OpenCv4,
    OpenCv5,
    OpenCv8,
    OpenCv12,
    Cahvor,
    Cahvore,
    SplinedStereographic(SplinedConfig),
}

struct ModelDescriptor {
    name: &'static str,
    /// None when the count depends on the configuration
    n_params: Option<usize>,
    has_core: bool,
}

const DESCRIPTORS: [ModelDescriptor; 8] = [
    ModelDescriptor { name: "PINHOLE", n_params: Some(4), has_core: true },
    ModelDescriptor { name: "OPENCV4", n_params: Some(8), has_core: true },
    ModelDescriptor { name: "OPENCV5", n_params: Some(9), has_core: true },
    ModelDescriptor { name: "OPENCV8", n_params: Some(12), has_core: true },
    ModelDescriptor { name: "OPENCV12", n_params: Some(16), has_core: true },
    ModelDescriptor { name: "CAHVOR", n_params: Some(9), has_core: true },
    ModelDescriptor { name: "CAHVORE", n_params: Some(13), has_core: true },
    ModelDescriptor { name: "SPLINED_STEREOGRAPHIC", n_params: None, has_core: false },
];

const ALL_MODELS: [LensModel; 7] = [
    LensModel::Pinhole,
    LensModel::OpenCv4,
    LensModel::OpenCv5,
    LensModel::OpenCv8,
    LensModel::OpenCv12,
    LensModel::Cahvor,
    LensModel::Cahvore,
];

const FAMILY_OPENCV: [LensModel; 5] = [
    LensModel::Pinhole,
    LensModel::OpenCv4,
    LensModel::OpenCv5,
    LensModel::OpenCv8,
    LensModel::OpenCv12,
];

const FAMILY_CAHVOR: [LensModel; 3] =
    [LensModel::Pinhole, LensModel::Cahvor, LensModel::Cahvore];

impl LensModel {
    fn descriptor_index(&self) -> usize {
        match self {
            LensModel::Pinhole => 0,
            LensModel::OpenCv4 => 1,
            LensModel::OpenCv5 => 2,
            LensModel::OpenCv8 => 3,
            LensModel::OpenCv12 => 4,
            LensModel::Cahvor => 5,
            LensModel::Cahvore => 6,
            LensModel::SplinedStereographic(_) => 7,
        }
    }

    fn descriptor(&self) -> &'static ModelDescriptor {
        &DESCRIPTORS[self.descriptor_index()]
    }

    /// The model's name without any configuration values.
    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    /// Total number of intrinsics values, including the core when present.
    pub fn n_lens_params(&self) -> usize {
        match self {
            LensModel::SplinedStereographic(config) => config.n_params(),
            other => other.descriptor().n_params.unwrap(),
        }
    }

    /// Does this model start with the (fx, fy, cx, cy) core?
    pub fn has_core(&self) -> bool {
        self.descriptor().has_core
    }

    /// Number of intrinsics values past the core.
    pub fn n_distortion_params(&self) -> usize {
        let n_core = if self.has_core() { 4 } else { 0 };
        self.n_lens_params() - n_core
    }

    pub fn is_opencv(&self) -> bool {
        matches!(
            self,
            LensModel::OpenCv4 | LensModel::OpenCv5 | LensModel::OpenCv8 | LensModel::OpenCv12
        )
    }

    /// Names of every supported model. Configured models report their name
    /// with a `_...` placeholder.
    pub fn supported_names() -> Vec<String> {
        DESCRIPTORS
            .iter()
            .map(|d| {
                if d.n_params.is_some() {
                    d.name.to_string()
                } else {
                    format!("{}_...", d.name)
                }
            })
            .collect()
    }

    /// The next model of increasing complexity in the family that ends at
    /// `target`.
    ///
    /// Families start at `PINHOLE` and add distortion parameters at the end
    /// of the vector, so walking from `PINHOLE` toward `target` unlocks the
    /// distortion terms progressively. Returns `now` itself once `target` is
    /// reached.
    pub fn next_in_family(now: &LensModel, target: &LensModel) -> Result<LensModel> {
        if *target == LensModel::Pinhole {
            // every family begins at PINHOLE, so PINHOLE alone names no family
            return Err(Error::NoFamilySequence {
                now: now.to_string(),
                target: target.to_string(),
            });
        }
        let family: &[LensModel] = if FAMILY_OPENCV.contains(target) {
            &FAMILY_OPENCV
        } else if FAMILY_CAHVOR.contains(target) {
            &FAMILY_CAHVOR
        } else {
            return Err(Error::NoFamilySequence {
                now: now.to_string(),
                target: target.to_string(),
            });
        };

        if now == target {
            return Ok(*now);
        }
        let pos_now = family.iter().position(|m| m == now);
        let pos_target = family.iter().position(|m| m == target).unwrap();
        match pos_now {
            Some(pos) if pos < pos_target => Ok(family[pos + 1]),
            _ => Err(Error::NoFamilySequence {
                now: now.to_string(),
                target: target.to_string(),
            }),
        }
    }
}

impl fmt::Display for LensModel {
    /// Writes the full name, configuration values included.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensModel::SplinedStereographic(config) => {
                write!(f, "{}_{}", self.name(), config)
            }
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for LensModel {
    type Err = Error;

    fn from_str(name: &str) -> Result<LensModel> {
        for model in ALL_MODELS {
            if name == model.name() {
                return Ok(model);
            }
        }

        let splined_prefix = DESCRIPTORS[7].name;
        if name == splined_prefix {
            // a configured model with no configuration at all
            return Err(Error::BadModelConfig(name.to_string()));
        }
        if let Some(tail) = name.strip_prefix(splined_prefix) {
            if let Some(tail) = tail.strip_prefix('_') {
                return match SplinedConfig::parse(tail) {
                    Some(config) => Ok(LensModel::SplinedStereographic(config)),
                    None => Err(Error::BadModelConfig(name.to_string())),
                };
            }
        }

        Err(Error::UnknownModelName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_counts() {
        assert_eq!(LensModel::Pinhole.n_lens_params(), 4);
        assert_eq!(LensModel::OpenCv4.n_lens_params(), 8);
        assert_eq!(LensModel::OpenCv5.n_lens_params(), 9);
        assert_eq!(LensModel::OpenCv8.n_lens_params(), 12);
        assert_eq!(LensModel::OpenCv12.n_lens_params(), 16);
        assert_eq!(LensModel::Cahvor.n_lens_params(), 9);
        assert_eq!(LensModel::Cahvore.n_lens_params(), 13);

        let splined: LensModel = "SPLINED_STEREOGRAPHIC_3_8_6_120.0_960.0_540.0"
            .parse()
            .unwrap();
        assert_eq!(splined.n_lens_params(), 8 * 6 * 2);
        assert!(!splined.has_core());
        assert_eq!(splined.n_distortion_params(), 96);
    }

    #[test]
    fn name_roundtrip() {
        for name in [
            "PINHOLE",
            "OPENCV4",
            "OPENCV8",
            "CAHVOR",
            "CAHVORE",
            "SPLINED_STEREOGRAPHIC_3_8_6_120.0_960.0_540.0",
            "SPLINED_STEREOGRAPHIC_3_30_20_170.5_1999.5_1099.5",
        ] {
            let model: LensModel = name.parse().unwrap();
            assert_eq!(model.to_string(), name);
        }
    }

    #[test]
    fn bad_names() {
        assert!(matches!(
            "LENSMODEL_BOGUS".parse::<LensModel>(),
            Err(Error::UnknownModelName(_))
        ));
        // a configured model without its configuration
        assert!(matches!(
            "SPLINED_STEREOGRAPHIC".parse::<LensModel>(),
            Err(Error::BadModelConfig(_))
        ));
        // a dangling suffix must not parse
        assert!(matches!(
            "SPLINED_STEREOGRAPHIC_3_8_6_120.0_960.0_540.0_7".parse::<LensModel>(),
            Err(Error::BadModelConfig(_))
        ));
        // grid too small
        assert!(matches!(
            "SPLINED_STEREOGRAPHIC_3_3_6_120.0_960.0_540.0".parse::<LensModel>(),
            Err(Error::BadModelConfig(_))
        ));
        // only cubic splines are supported
        assert!(matches!(
            "SPLINED_STEREOGRAPHIC_2_8_6_120.0_960.0_540.0".parse::<LensModel>(),
            Err(Error::BadModelConfig(_))
        ));
    }

    #[test]
    fn family_walk() {
        let next =
            LensModel::next_in_family(&LensModel::Pinhole, &LensModel::OpenCv8).unwrap();
        assert_eq!(next, LensModel::OpenCv4);
        let next = LensModel::next_in_family(&next, &LensModel::OpenCv8).unwrap();
        assert_eq!(next, LensModel::OpenCv5);
        let next = LensModel::next_in_family(&next, &LensModel::OpenCv8).unwrap();
        assert_eq!(next, LensModel::OpenCv8);
        // at the end of the sequence the model reports itself
        let next = LensModel::next_in_family(&next, &LensModel::OpenCv8).unwrap();
        assert_eq!(next, LensModel::OpenCv8);

        assert_eq!(
            LensModel::next_in_family(&LensModel::Pinhole, &LensModel::Cahvore).unwrap(),
            LensModel::Cahvor
        );
        assert!(LensModel::next_in_family(&LensModel::Pinhole, &LensModel::Pinhole).is_err());
        assert!(LensModel::next_in_family(&LensModel::Cahvor, &LensModel::OpenCv8).is_err());
    }
}
