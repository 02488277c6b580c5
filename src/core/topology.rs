//! Topology represents an N-dimensional space through a list of dimensions and corresponding stride values.
//! The struct provides methods to convert between flat indices and coordinates in this N-dimensional space,
//! both for a single index and for whole lists of indices in the parallel "coordinate list" layout.
//!
//! In the HTM context every SDR lives in such a space. An SDR can be addressed by flat indices into the
//! flattened space or by per-dimension coordinate lists, and `Topology` converts between the two.
//! The layout is row-major: the last dimension varies fastest.

use crate::error::{HtmError, Result};
use serde::{Deserialize, Serialize};

/// Represents the shape of an N-dimensional space, along with precomputed stride values for
/// flat index conversions. The `dims` field stores the size of each dimension, while `strides`
/// stores the cumulative product of the trailing dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    dims: Vec<u32>,
    strides: Vec<usize>,
    size: usize,
}

impl Topology {
    /// Creates a new `Topology` from a slice of dimension sizes.
    /// Fails if there are no dimensions or if any dimension is zero.
    #[inline]
    pub fn new(dimensions: &[u32]) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(HtmError::invalid("dimensions", "at least one dimension is required"));
        }
        if dimensions.contains(&0) {
            return Err(HtmError::invalid(
                "dimensions",
                format!("every dimension must be greater than zero, got {dimensions:?}"),
            ));
        }

        let dims = dimensions.to_vec();
        let strides = Self::strides(&dims);
        let size = dims.iter().map(|&d| d as usize).product();

        Ok(Self {
            dims,
            strides,
            size,
        })
    }

    /// Computes the stride values for each dimension in a given slice of dimension sizes.
    #[inline]
    fn strides(dims: &[u32]) -> Vec<usize> {
        let mut strides = vec![1; dims.len()];

        for i in (0..dims.len() - 1).rev() {
            strides[i] = strides[i + 1] * dims[i + 1] as usize;
        }

        strides
    }

    /// The size of every dimension.
    #[inline]
    pub fn dimensions(&self) -> &[u32] {
        &self.dims
    }

    /// Total number of elements, the product of all dimensions.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Converts a flat index into its coordinates, one entry per dimension.
    #[inline]
    pub fn coordinates(&self, index: usize) -> Vec<u32> {
        let mut remainder = index;

        self.strides
            .iter()
            .map(|&stride| {
                let coord = remainder / stride;
                remainder %= stride;
                coord as u32
            })
            .collect()
    }

    /// Converts a set of coordinates into a flat index.
    /// Every coordinate must lie within its dimension.
    #[inline]
    pub fn index_from_coordinates(&self, coords: &[u32]) -> Result<usize> {
        if coords.len() != self.dims.len() {
            return Err(HtmError::DimensionMismatch {
                expected: self.dims.clone(),
                actual: coords.to_vec(),
            });
        }

        let mut flat = 0;
        for ((&c, &dim), &stride) in coords.iter().zip(&self.dims).zip(&self.strides) {
            if c >= dim {
                return Err(HtmError::out_of_range("coordinate", c as usize, dim as usize));
            }
            flat += c as usize * stride;
        }

        Ok(flat)
    }

    /// Splits a list of flat indices into parallel per-dimension coordinate lists.
    pub fn coordinate_lists(&self, flat: &[u32]) -> Vec<Vec<u32>> {
        let mut lists = vec![Vec::with_capacity(flat.len()); self.dims.len()];

        for &index in flat {
            let mut remainder = index as usize;
            for (list, &stride) in lists.iter_mut().zip(&self.strides) {
                list.push((remainder / stride) as u32);
                remainder %= stride;
            }
        }

        lists
    }

    /// Joins parallel per-dimension coordinate lists back into flat indices.
    /// The lists must already have been validated against this topology.
    pub fn flatten(&self, lists: &[Vec<u32>]) -> Vec<u32> {
        let count = lists.first().map_or(0, Vec::len);

        (0..count)
            .map(|nz| {
                lists
                    .iter()
                    .zip(&self.strides)
                    .map(|(list, &stride)| list[nz] as usize * stride)
                    .sum::<usize>() as u32
            })
            .collect()
    }

    /// Checks parallel coordinate lists against this topology: one list per dimension,
    /// all lists of equal length and every coordinate within its dimension.
    pub fn validate_coordinate_lists(&self, lists: &[Vec<u32>]) -> Result<()> {
        if lists.len() != self.dims.len() {
            return Err(HtmError::DimensionMismatch {
                expected: self.dims.clone(),
                actual: vec![lists.len() as u32],
            });
        }

        let count = lists[0].len();
        for (list, &dim) in lists.iter().zip(&self.dims) {
            if list.len() != count {
                return Err(HtmError::invalid(
                    "coordinates",
                    "every dimension must list the same number of coordinates",
                ));
            }
            if let Some(&bad) = list.iter().find(|&&c| c >= dim) {
                return Err(HtmError::out_of_range("coordinate", bad as usize, dim as usize));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_zero_dimensions() {
        assert!(Topology::new(&[]).is_err());
        assert!(Topology::new(&[3, 0]).is_err());
    }

    #[test]
    fn flat_and_coordinates_agree() {
        let topology = Topology::new(&[3, 4, 5]).unwrap();
        assert_eq!(topology.size(), 60);

        for index in 0..topology.size() {
            let coords = topology.coordinates(index);
            assert_eq!(topology.index_from_coordinates(&coords).unwrap(), index);
        }
        assert_eq!(topology.coordinates(23), vec![1, 0, 3]);
    }

    #[test]
    fn coordinate_lists_are_parallel() {
        let topology = Topology::new(&[4, 4]).unwrap();
        let lists = topology.coordinate_lists(&[1, 5, 15]);

        assert_eq!(lists, vec![vec![0, 1, 3], vec![1, 1, 3]]);
        assert_eq!(topology.flatten(&lists), vec![1, 5, 15]);
    }

    #[test]
    fn coordinate_lists_are_validated() {
        let topology = Topology::new(&[2, 3]).unwrap();

        assert!(topology.validate_coordinate_lists(&[vec![0, 1], vec![2, 2]]).is_ok());
        assert!(topology.validate_coordinate_lists(&[vec![0, 1]]).is_err());
        assert!(topology.validate_coordinate_lists(&[vec![0, 1], vec![2]]).is_err());
        assert!(matches!(
            topology.validate_coordinate_lists(&[vec![2], vec![0]]),
            Err(HtmError::IndexOutOfRange { .. })
        ));
    }
}
