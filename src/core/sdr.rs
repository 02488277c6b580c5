//! Sparse Distributed Representation (SDR).
//!
//! An SDR is a boolean tensor with a fixed shape. Its value can be read and written in three formats:
//! - **Dense**: one byte per bit, `0` or `1`, in row-major order.
//! - **Sparse**: the flat indices of the true bits.
//! - **Coordinates**: one list per dimension, the lists are parallel so that entry `i` of every
//!   list together forms the coordinates of the `i`-th true bit.
//!
//! Writing any format stores only that format. The other two are computed on first read and cached
//! until the next write. Every write notifies the registered callbacks once the new value is in place.
//!
//! An SDR starts out as all zeros, so there is always a value to read.
//!
//! `SdrProxy` is a read-only view of another SDR with different dimensions but the same size. It
//! holds a weak reference to its source and fails with `HtmError::ProxySourceDropped` once the
//! source is gone.

use crate::core::random::Random;
use crate::core::serialization::{self, write_vec, TokenReader};
use crate::core::topology::Topology;
use crate::error::{HtmError, Result};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use std::cell::{OnceCell, Ref, RefCell};
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::rc::{Rc, Weak};

const SDR_VERSION: u32 = 1;

/// A change listener registered on an SDR.
pub type SdrCallback = Rc<dyn Fn()>;

/// Registry of callbacks addressed by integer handles. Freed handles are reused.
#[derive(Default)]
struct CallbackList {
    slots: RefCell<Vec<Option<SdrCallback>>>,
}

impl CallbackList {
    fn add(&self, callback: SdrCallback) -> usize {
        let mut slots = self.slots.borrow_mut();

        match slots.iter().position(Option::is_none) {
            Some(handle) => {
                slots[handle] = Some(callback);
                handle
            }
            None => {
                slots.push(Some(callback));
                slots.len() - 1
            }
        }
    }

    fn remove(&self, handle: usize) -> Result<()> {
        let mut slots = self.slots.borrow_mut();
        let size = slots.len();

        match slots.get_mut(handle) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(HtmError::out_of_range("callback handle", handle, size)),
        }
    }

    fn notify(&self) {
        // Snapshot first, a callback may register or remove callbacks.
        let callbacks: Vec<SdrCallback> = self.slots.borrow().iter().flatten().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }
}

/// The cached formats of one SDR value. At least one of them is always set.
#[derive(Default)]
struct SdrValue {
    dense: OnceCell<Vec<u8>>,
    sparse: OnceCell<Vec<u32>>,
    coordinates: OnceCell<Vec<Vec<u32>>>,
}

impl SdrValue {
    fn from_dense(dense: Vec<u8>) -> Self {
        let value = Self::default();
        let _ = value.dense.set(dense);
        value
    }

    fn from_sparse(sparse: Vec<u32>) -> Self {
        let value = Self::default();
        let _ = value.sparse.set(sparse);
        value
    }

    fn from_coordinates(coordinates: Vec<Vec<u32>>) -> Self {
        let value = Self::default();
        let _ = value.coordinates.set(coordinates);
        value
    }

    fn sparse(&self, topology: &Topology) -> &[u32] {
        self.sparse.get_or_init(|| match self.dense.get() {
            Some(dense) => dense
                .iter()
                .enumerate()
                .filter(|(_, &bit)| bit != 0)
                .map(|(index, _)| index as u32)
                .collect(),
            None => topology.flatten(self.coordinates.get().map_or(&[][..], Vec::as_slice)),
        })
    }

    fn dense(&self, topology: &Topology) -> &[u8] {
        self.dense.get_or_init(|| {
            let mut dense = vec![0; topology.size()];
            for &index in self.sparse(topology) {
                dense[index as usize] = 1;
            }
            dense
        })
    }

    fn coordinates(&self, topology: &Topology) -> &[Vec<u32>] {
        self.coordinates
            .get_or_init(|| topology.coordinate_lists(self.sparse(topology)))
    }
}

struct SdrInner {
    topology: Topology,
    value: RefCell<SdrValue>,
    callbacks: CallbackList,
}

/// Sparse Distributed Representation with lazily converted formats.
///
/// ```
/// use htm_temporal::core::sdr::Sdr;
///
/// let mut sdr = Sdr::new(&[4, 4]).unwrap();
/// sdr.set_sparse(&[1, 5, 15]).unwrap();
///
/// assert_eq!(sdr.get_sum(), 3);
/// assert_eq!(&*sdr.get_coordinates(), &[vec![0, 1, 3], vec![1, 1, 3]]);
/// ```
pub struct Sdr {
    inner: Rc<SdrInner>,
}

impl Sdr {
    /// Creates an all-zero SDR with the given dimensions.
    pub fn new(dimensions: &[u32]) -> Result<Self> {
        Ok(Self::with_topology(Topology::new(dimensions)?))
    }

    /// Creates an SDR and sets its value from flat indices.
    pub fn from_sparse(dimensions: &[u32], sparse: &[u32]) -> Result<Self> {
        let mut sdr = Self::new(dimensions)?;
        sdr.set_sparse(sparse)?;
        Ok(sdr)
    }

    fn with_topology(topology: Topology) -> Self {
        Self {
            inner: Rc::new(SdrInner {
                topology,
                value: RefCell::new(SdrValue::from_sparse(Vec::new())),
                callbacks: CallbackList::default(),
            }),
        }
    }

    #[inline]
    pub fn dimensions(&self) -> &[u32] {
        self.inner.topology.dimensions()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.inner.topology.size()
    }

    fn check_same_dimensions(&self, other: &Sdr) -> Result<()> {
        if self.dimensions() != other.dimensions() {
            return Err(HtmError::DimensionMismatch {
                expected: self.dimensions().to_vec(),
                actual: other.dimensions().to_vec(),
            });
        }
        Ok(())
    }

    fn store(&mut self, value: SdrValue) {
        *self.inner.value.borrow_mut() = value;
        self.inner.callbacks.notify();
    }

    /// Sets every bit to false.
    pub fn zero(&mut self) {
        self.store(SdrValue::from_sparse(Vec::new()));
    }

    /// Sets the value from a dense array. Any non-zero byte counts as a true bit.
    pub fn set_dense(&mut self, dense: &[u8]) -> Result<()> {
        self.set_dense_owned(dense.to_vec())
    }

    /// Sets the value from a dense array, taking ownership of the buffer.
    pub fn set_dense_owned(&mut self, mut dense: Vec<u8>) -> Result<()> {
        if dense.len() != self.size() {
            return Err(HtmError::DimensionMismatch {
                expected: vec![self.size() as u32],
                actual: vec![dense.len() as u32],
            });
        }
        for bit in dense.iter_mut() {
            *bit = u8::from(*bit != 0);
        }

        self.store(SdrValue::from_dense(dense));
        Ok(())
    }

    /// Sets the value from flat indices. The indices do not need to be sorted but must be unique
    /// and within `[0, size)`.
    pub fn set_sparse(&mut self, sparse: &[u32]) -> Result<()> {
        self.set_sparse_owned(sparse.to_vec())
    }

    /// Sets the value from flat indices, taking ownership of the buffer.
    pub fn set_sparse_owned(&mut self, sparse: Vec<u32>) -> Result<()> {
        check_sparse(&sparse, self.size())?;
        self.store(SdrValue::from_sparse(sparse));
        Ok(())
    }

    /// Sets the value from parallel per-dimension coordinate lists.
    pub fn set_coordinates(&mut self, coordinates: &[Vec<u32>]) -> Result<()> {
        self.set_coordinates_owned(coordinates.to_vec())
    }

    /// Sets the value from coordinate lists, taking ownership of them.
    pub fn set_coordinates_owned(&mut self, coordinates: Vec<Vec<u32>>) -> Result<()> {
        self.inner.topology.validate_coordinate_lists(&coordinates)?;
        check_sparse(&self.inner.topology.flatten(&coordinates), self.size())?;

        self.store(SdrValue::from_coordinates(coordinates));
        Ok(())
    }

    /// Copies the value of another SDR with the same dimensions.
    pub fn set_sdr(&mut self, other: &Sdr) -> Result<()> {
        self.check_same_dimensions(other)?;
        let sparse = other.get_sparse().to_vec();
        self.store(SdrValue::from_sparse(sparse));
        Ok(())
    }

    /// The value as a dense array of `0`/`1` bytes.
    pub fn get_dense(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.value.borrow(), |value| {
            value.dense(&self.inner.topology)
        })
    }

    /// The flat indices of the true bits.
    pub fn get_sparse(&self) -> Ref<'_, [u32]> {
        Ref::map(self.inner.value.borrow(), |value| {
            value.sparse(&self.inner.topology)
        })
    }

    /// The coordinates of the true bits, one list per dimension.
    pub fn get_coordinates(&self) -> Ref<'_, [Vec<u32>]> {
        Ref::map(self.inner.value.borrow(), |value| {
            value.coordinates(&self.inner.topology)
        })
    }

    /// Reads a single bit.
    pub fn at(&self, coordinates: &[u32]) -> Result<bool> {
        let index = self.inner.topology.index_from_coordinates(coordinates)?;
        Ok(self.get_dense()[index] != 0)
    }

    /// Number of true bits.
    pub fn get_sum(&self) -> usize {
        self.get_sparse().len()
    }

    /// Fraction of true bits.
    pub fn get_sparsity(&self) -> f32 {
        self.get_sum() as f32 / self.size() as f32
    }

    /// Number of true bits shared with `other`. Both SDRs must have the same dimensions.
    pub fn overlap(&self, other: &Sdr) -> Result<usize> {
        self.check_same_dimensions(other)?;

        let dense = other.get_dense();
        Ok(self
            .get_sparse()
            .iter()
            .filter(|&&index| dense[index as usize] != 0)
            .count())
    }

    /// Sets this SDR to the bits that are true in both `a` and `b`.
    pub fn intersection(&mut self, a: &Sdr, b: &Sdr) -> Result<()> {
        self.check_same_dimensions(a)?;
        self.check_same_dimensions(b)?;

        let dense = b.get_dense();
        let mut sparse: Vec<u32> = a
            .get_sparse()
            .iter()
            .copied()
            .filter(|&index| dense[index as usize] != 0)
            .collect();
        sparse.sort_unstable();
        drop(dense);

        self.store(SdrValue::from_sparse(sparse));
        Ok(())
    }

    /// Sets this SDR to the bits that are true in `a` or `b`.
    pub fn set_union(&mut self, a: &Sdr, b: &Sdr) -> Result<()> {
        self.check_same_dimensions(a)?;
        self.check_same_dimensions(b)?;

        let dense: Vec<u8> = a
            .get_dense()
            .iter()
            .zip(b.get_dense().iter())
            .map(|(&x, &y)| x | y)
            .collect();

        self.store(SdrValue::from_dense(dense));
        Ok(())
    }

    /// Concatenates `inputs` along the first dimension.
    pub fn concatenate(&mut self, inputs: &[&Sdr]) -> Result<()> {
        self.concatenate_axis(inputs, 0)
    }

    /// Concatenates `inputs` along `axis`. Every input must have the same number of dimensions as
    /// this SDR and agree with it on every dimension except `axis`, and the input sizes along `axis`
    /// must add up to this SDR's size along `axis`.
    pub fn concatenate_axis(&mut self, inputs: &[&Sdr], axis: usize) -> Result<()> {
        let dims = self.dimensions().to_vec();
        if inputs.is_empty() {
            return Err(HtmError::invalid("inputs", "nothing to concatenate"));
        }
        if axis >= dims.len() {
            return Err(HtmError::out_of_range("axis", axis, dims.len()));
        }

        let mut axis_total = 0;
        for input in inputs {
            let input_dims = input.dimensions();
            let agrees = input_dims.len() == dims.len()
                && input_dims
                    .iter()
                    .zip(&dims)
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !agrees {
                return Err(HtmError::DimensionMismatch {
                    expected: dims.clone(),
                    actual: input_dims.to_vec(),
                });
            }
            axis_total += input_dims[axis];
        }
        if axis_total != dims[axis] {
            return Err(HtmError::invalid(
                "inputs",
                format!(
                    "sizes along axis {axis} add up to {axis_total}, expected {}",
                    dims[axis]
                ),
            ));
        }

        let outer: usize = dims[..axis].iter().map(|&d| d as usize).product();
        let inner: usize = dims[axis + 1..].iter().map(|&d| d as usize).product();
        let denses: Vec<Ref<'_, [u8]>> = inputs.iter().map(|input| input.get_dense()).collect();

        let mut dense = Vec::with_capacity(self.size());
        for row in 0..outer {
            for (input, input_dense) in inputs.iter().zip(&denses) {
                let block = input.dimensions()[axis] as usize * inner;
                dense.extend_from_slice(&input_dense[row * block..(row + 1) * block]);
            }
        }
        drop(denses);

        self.store(SdrValue::from_dense(dense));
        Ok(())
    }

    /// Sets a random value with `round(size * sparsity)` true bits, seeded with 0.
    pub fn randomize(&mut self, sparsity: f32) -> Result<()> {
        self.randomize_with(sparsity, &mut Random::new(0))
    }

    /// Sets a random value with `round(size * sparsity)` true bits.
    pub fn randomize_with(&mut self, sparsity: f32, rng: &mut Random) -> Result<()> {
        if !(0.0..=1.0).contains(&sparsity) {
            return Err(HtmError::invalid(
                "sparsity",
                format!("must be within [0, 1], got {sparsity}"),
            ));
        }

        let bits = (self.size() as f32 * sparsity + 0.5) as usize;
        let population: Vec<u32> = (0..self.size() as u32).collect();
        let sparse = rng.sample(&population, bits.min(population.len()))?;

        self.store(SdrValue::from_sparse(sparse));
        Ok(())
    }

    /// Moves `round(fraction * sum)` true bits to random false positions, seeded with 0.
    pub fn add_noise(&mut self, fraction: f32) -> Result<()> {
        self.add_noise_with(fraction, &mut Random::new(0))
    }

    /// Moves `round(fraction * sum)` true bits to random false positions. The sum and sparsity are
    /// unchanged, and `(1 + fraction) * sparsity` must not exceed 1.
    pub fn add_noise_with(&mut self, fraction: f32, rng: &mut Random) -> Result<()> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(HtmError::invalid(
                "fraction",
                format!("must be within [0, 1], got {fraction}"),
            ));
        }
        if (1.0 + fraction) * self.get_sparsity() > 1.0 {
            return Err(HtmError::invalid(
                "fraction",
                "not enough false bits to move the noise into",
            ));
        }

        let moves = (fraction * self.get_sum() as f32).round() as usize;
        let turn_off = rng.sample(&*self.get_sparse(), moves)?;

        let mut dense = self.get_dense().to_vec();
        let off_population: Vec<u32> = dense
            .iter()
            .enumerate()
            .filter(|(_, &bit)| bit == 0)
            .map(|(index, _)| index as u32)
            .collect();
        let turn_on = rng.sample(&off_population, moves)?;

        for index in turn_off {
            dense[index as usize] = 0;
        }
        for index in turn_on {
            dense[index as usize] = 1;
        }

        self.store(SdrValue::from_dense(dense));
        Ok(())
    }

    /// Registers a callback fired after every change of value. Returns its handle.
    pub fn add_callback(&self, callback: impl Fn() + 'static) -> usize {
        self.inner.callbacks.add(Rc::new(callback))
    }

    /// Removes a callback. Fails if the handle is not registered.
    pub fn remove_callback(&self, handle: usize) -> Result<()> {
        self.inner.callbacks.remove(handle)
    }

    /// Creates a read-only view of this SDR with different dimensions of the same size.
    pub fn proxy(&self, dimensions: &[u32]) -> Result<SdrProxy> {
        SdrProxy::new(self, dimensions)
    }

    /// Writes the dimensions and flat indices in the tagged text format.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "SDR {SDR_VERSION}")?;
        write_vec(out, self.dimensions())?;
        write_vec(out, &*self.get_sparse())?;
        writeln!(out, "~SDR")?;
        Ok(())
    }

    /// Reads an SDR written by [`Sdr::save`].
    pub fn load<R: BufRead>(input: &mut TokenReader<R>) -> Result<Self> {
        input.expect_marker("SDR")?;
        input.expect_version(SDR_VERSION)?;
        let dimensions = input.parse_vec::<u32>()?;
        let sparse = input.parse_vec::<u32>()?;
        input.expect_marker("~SDR")?;

        Self::from_sparse(&dimensions, &sparse)
    }

    /// Writes a versioned binary snapshot.
    pub fn save_binary<W: Write>(&self, out: &mut W) -> Result<()> {
        serialization::save_binary(out, "SDR", SDR_VERSION, self)
    }

    /// Reads a snapshot written by [`Sdr::save_binary`].
    pub fn load_binary<R: Read>(input: &mut R) -> Result<Self> {
        serialization::load_binary(input, "SDR", SDR_VERSION)
    }
}

fn check_sparse(sparse: &[u32], size: usize) -> Result<()> {
    if let Some(&bad) = sparse.iter().find(|&&index| index as usize >= size) {
        return Err(HtmError::out_of_range("sparse", bad as usize, size));
    }

    if !sparse.windows(2).all(|w| w[0] < w[1]) {
        let mut sorted = sparse.to_vec();
        sorted.sort_unstable();
        if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(HtmError::invalid(
                "sparse",
                format!("index {} appears more than once", w[0]),
            ));
        }
    }

    Ok(())
}

impl Clone for Sdr {
    /// Copies the dimensions and value. Callbacks are not copied.
    fn clone(&self) -> Self {
        let sdr = Self::with_topology(self.inner.topology.clone());
        *sdr.inner.value.borrow_mut() = SdrValue::from_sparse(self.get_sparse().to_vec());
        sdr
    }
}

impl PartialEq for Sdr {
    fn eq(&self, other: &Self) -> bool {
        self.dimensions() == other.dimensions() && *self.get_dense() == *other.get_dense()
    }
}

impl Eq for Sdr {}

impl fmt::Debug for Sdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sdr")
            .field("dimensions", &self.dimensions())
            .field("sparse", &&*self.get_sparse())
            .finish()
    }
}

impl fmt::Display for Sdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_shape(f, self.dimensions())?;
        write_joined(f, &self.get_sparse())
    }
}

fn write_shape(f: &mut fmt::Formatter<'_>, dimensions: &[u32]) -> fmt::Result {
    write!(f, "SDR( ")?;
    write_joined(f, dimensions)?;
    write!(f, " ) ")
}

fn write_joined(f: &mut fmt::Formatter<'_>, values: &[u32]) -> fmt::Result {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct SdrState {
    dimensions: Vec<u32>,
    sparse: Vec<u32>,
}

impl Serialize for Sdr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        SdrState {
            dimensions: self.dimensions().to_vec(),
            sparse: self.get_sparse().to_vec(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Sdr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let state = SdrState::deserialize(deserializer)?;
        Sdr::from_sparse(&state.dimensions, &state.sparse).map_err(D::Error::custom)
    }
}

/// Proxy-side state, shared with the callback registered on the source.
#[derive(Default)]
struct ProxyState {
    coordinates: RefCell<Option<Vec<Vec<u32>>>>,
    callbacks: CallbackList,
}

/// A read-only view of another SDR under different dimensions.
///
/// The view always reflects the current value of its source. Listeners registered on the proxy are
/// notified whenever the source changes. Dropping the proxy deregisters it from the source.
pub struct SdrProxy {
    source: Weak<SdrInner>,
    topology: Topology,
    handle: usize,
    state: Rc<ProxyState>,
}

impl SdrProxy {
    /// Creates a view of `source` with the given dimensions. Their product must equal the size of
    /// the source.
    pub fn new(source: &Sdr, dimensions: &[u32]) -> Result<Self> {
        let topology = Topology::new(dimensions)?;
        if topology.size() != source.size() {
            return Err(HtmError::DimensionMismatch {
                expected: source.dimensions().to_vec(),
                actual: dimensions.to_vec(),
            });
        }

        let state = Rc::new(ProxyState::default());
        let listener = Rc::clone(&state);
        let handle = source.add_callback(move || {
            listener.coordinates.borrow_mut().take();
            listener.callbacks.notify();
        });

        Ok(Self {
            source: Rc::downgrade(&source.inner),
            topology,
            handle,
            state,
        })
    }

    fn source(&self) -> Result<Rc<SdrInner>> {
        self.source.upgrade().ok_or(HtmError::ProxySourceDropped)
    }

    #[inline]
    pub fn dimensions(&self) -> &[u32] {
        self.topology.dimensions()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.topology.size()
    }

    pub fn get_dense(&self) -> Result<Vec<u8>> {
        let source = self.source()?;
        let value = source.value.borrow();
        Ok(value.dense(&source.topology).to_vec())
    }

    /// Flat indices are shared with the source, only the shape differs.
    pub fn get_sparse(&self) -> Result<Vec<u32>> {
        let source = self.source()?;
        let value = source.value.borrow();
        Ok(value.sparse(&source.topology).to_vec())
    }

    /// Coordinates under the proxy's dimensions, cached until the source changes.
    pub fn get_coordinates(&self) -> Result<Vec<Vec<u32>>> {
        let source = self.source()?;
        let mut cache = self.state.coordinates.borrow_mut();

        if let Some(coordinates) = cache.as_ref() {
            return Ok(coordinates.clone());
        }
        let value = source.value.borrow();
        let coordinates = self.topology.coordinate_lists(value.sparse(&source.topology));
        *cache = Some(coordinates.clone());
        Ok(coordinates)
    }

    pub fn get_sum(&self) -> Result<usize> {
        let source = self.source()?;
        let value = source.value.borrow();
        Ok(value.sparse(&source.topology).len())
    }

    /// Copies the current value into a standalone SDR with the proxy's dimensions.
    pub fn to_sdr(&self) -> Result<Sdr> {
        let sparse = self.get_sparse()?;
        let mut sdr = Sdr::with_topology(self.topology.clone());
        sdr.set_sparse_owned(sparse)?;
        Ok(sdr)
    }

    pub fn add_callback(&self, callback: impl Fn() + 'static) -> usize {
        self.state.callbacks.add(Rc::new(callback))
    }

    pub fn remove_callback(&self, handle: usize) -> Result<()> {
        self.state.callbacks.remove(handle)
    }
}

impl Drop for SdrProxy {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            let _ = source.callbacks.remove(self.handle);
        }
    }
}

impl fmt::Debug for SdrProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdrProxy")
            .field("dimensions", &self.dimensions())
            .field("sparse", &self.get_sparse())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::io::Cursor;

    #[test]
    fn formats_agree() {
        let mut sdr = Sdr::new(&[3, 3]).unwrap();
        sdr.set_dense(&[0, 1, 0, 0, 0, 0, 1, 0, 1]).unwrap();

        assert_eq!(&*sdr.get_sparse(), &[1, 6, 8]);
        assert_eq!(&*sdr.get_coordinates(), &[vec![0, 2, 2], vec![1, 0, 2]]);

        sdr.set_coordinates(&[vec![1], vec![1]]).unwrap();
        assert_eq!(&*sdr.get_sparse(), &[4]);
        assert_eq!(sdr.get_dense()[4], 1);
        assert_eq!(sdr.get_sum(), 1);
        assert!(sdr.at(&[1, 1]).unwrap());
        assert!(!sdr.at(&[0, 1]).unwrap());
    }

    #[test]
    fn reads_can_overlap() {
        let sdr = Sdr::from_sparse(&[10], &[2, 3]).unwrap();
        let sparse = sdr.get_sparse();
        let dense = sdr.get_dense();
        let coordinates = sdr.get_coordinates();

        assert_eq!(sparse.len(), 2);
        assert_eq!(dense[3], 1);
        assert_eq!(coordinates[0], vec![2, 3]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut sdr = Sdr::new(&[5]).unwrap();

        assert!(matches!(sdr.set_sparse(&[5]), Err(HtmError::IndexOutOfRange { .. })));
        assert!(sdr.set_sparse(&[3, 1, 3]).is_err());
        assert!(matches!(sdr.set_dense(&[0; 4]), Err(HtmError::DimensionMismatch { .. })));
        assert!(sdr.set_coordinates(&[vec![7]]).is_err());
        assert!(Sdr::new(&[4, 0]).is_err());

        sdr.set_sparse(&[4, 0]).unwrap();
        assert_eq!(&*sdr.get_sparse(), &[4, 0]);
        assert_eq!(&*sdr.get_dense(), &[1, 0, 0, 0, 1]);
    }

    #[test]
    fn callbacks_fire_once_per_change_and_handles_are_reused() {
        let mut sdr = Sdr::new(&[8]).unwrap();
        let hits = Rc::new(Cell::new(0));

        let counter = Rc::clone(&hits);
        let a = sdr.add_callback(move || counter.set(counter.get() + 1));
        let b = sdr.add_callback(|| {});
        assert_ne!(a, b);

        sdr.set_sparse(&[1]).unwrap();
        sdr.zero();
        assert_eq!(hits.get(), 2);

        sdr.remove_callback(a).unwrap();
        assert!(sdr.remove_callback(a).is_err());
        assert!(sdr.remove_callback(17).is_err());
        assert_eq!(sdr.add_callback(|| {}), a);

        sdr.set_sparse(&[2]).unwrap();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn overlap_intersection_union() {
        let a = Sdr::from_sparse(&[10], &[1, 2, 3, 4]).unwrap();
        let b = Sdr::from_sparse(&[10], &[3, 4, 5]).unwrap();
        let mut out = Sdr::new(&[10]).unwrap();

        assert_eq!(a.overlap(&b).unwrap(), 2);
        out.intersection(&a, &b).unwrap();
        assert_eq!(&*out.get_sparse(), &[3, 4]);
        out.set_union(&a, &b).unwrap();
        assert_eq!(&*out.get_sparse(), &[1, 2, 3, 4, 5]);

        let other = Sdr::new(&[2, 5]).unwrap();
        assert!(matches!(a.overlap(&other), Err(HtmError::DimensionMismatch { .. })));
    }

    #[test]
    fn concatenate_along_axes() {
        let a = Sdr::from_sparse(&[2, 2], &[0, 3]).unwrap();
        let b = Sdr::from_sparse(&[2, 1], &[1]).unwrap();

        let mut rows = Sdr::new(&[4, 2]).unwrap();
        rows.concatenate(&[&a, &a]).unwrap();
        assert_eq!(&*rows.get_sparse(), &[0, 3, 4, 7]);

        let mut cols = Sdr::new(&[2, 3]).unwrap();
        cols.concatenate_axis(&[&a, &b], 1).unwrap();
        assert_eq!(&*cols.get_dense(), &[1, 0, 0, 0, 1, 1]);

        assert!(cols.concatenate_axis(&[&a, &a], 1).is_err());
        assert!(rows.concatenate(&[&a, &b]).is_err());
    }

    #[test]
    fn randomize_hits_requested_sparsity() {
        let mut sdr = Sdr::new(&[100]).unwrap();
        sdr.randomize(0.05).unwrap();
        assert_eq!(sdr.get_sum(), 5);

        let mut again = Sdr::new(&[100]).unwrap();
        again.randomize(0.05).unwrap();
        assert_eq!(sdr, again);

        assert!(sdr.randomize(1.5).is_err());
    }

    #[test]
    fn add_noise_keeps_sum() {
        let mut sdr = Sdr::new(&[200]).unwrap();
        sdr.randomize(0.1).unwrap();
        let before = sdr.clone();

        sdr.add_noise_with(0.5, &mut Random::new(9)).unwrap();
        assert_eq!(sdr.get_sum(), 20);
        assert_eq!(before.overlap(&sdr).unwrap(), 10);

        let mut full = Sdr::new(&[4]).unwrap();
        full.set_sparse(&[0, 1, 2]).unwrap();
        assert!(full.add_noise(0.5).is_err());
    }

    #[test]
    fn display_lists_shape_and_bits() {
        let sdr = Sdr::from_sparse(&[4, 4], &[1, 5, 15]).unwrap();
        assert_eq!(sdr.to_string(), "SDR( 4, 4 ) 1, 5, 15");
    }

    #[test]
    fn save_and_load_text() {
        let sdr = Sdr::from_sparse(&[3, 7], &[0, 8, 20]).unwrap();
        let mut buffer = Vec::new();
        sdr.save(&mut buffer).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("SDR 1\n2 3 7 \n3 0 8 20 \n~SDR"));

        let loaded = Sdr::load(&mut TokenReader::new(Cursor::new(buffer))).unwrap();
        assert_eq!(loaded, sdr);

        let wrong = "SDR 2\n1 5 \n0 \n~SDR\n";
        assert!(Sdr::load(&mut TokenReader::new(Cursor::new(wrong))).is_err());
    }

    #[test]
    fn proxy_follows_source() {
        let mut sdr = Sdr::new(&[4, 4]).unwrap();
        let proxy = sdr.proxy(&[16]).unwrap();
        let changes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&changes);
        proxy.add_callback(move || counter.set(counter.get() + 1));

        sdr.set_coordinates(&[vec![1, 3], vec![2, 0]]).unwrap();
        assert_eq!(proxy.get_sparse().unwrap(), vec![6, 12]);
        assert_eq!(proxy.get_coordinates().unwrap(), vec![vec![6, 12]]);
        assert_eq!(changes.get(), 1);

        sdr.set_sparse(&[0]).unwrap();
        assert_eq!(proxy.get_coordinates().unwrap(), vec![vec![0]]);
        assert_eq!(proxy.to_sdr().unwrap().dimensions(), &[16]);

        assert!(sdr.proxy(&[15]).is_err());
    }

    #[test]
    fn proxy_fails_after_source_dropped() {
        let sdr = Sdr::new(&[10]).unwrap();
        let proxy = SdrProxy::new(&sdr, &[2, 5]).unwrap();
        drop(sdr);

        assert_eq!(proxy.get_sparse(), Err(HtmError::ProxySourceDropped));
        assert!(proxy.get_dense().is_err());
        assert!(proxy.get_coordinates().is_err());
    }

    #[test]
    fn dropping_proxy_deregisters_it() {
        let sdr = Sdr::new(&[10]).unwrap();
        let proxy = sdr.proxy(&[5, 2]).unwrap();
        let handle = proxy.handle;
        drop(proxy);

        assert!(sdr.remove_callback(handle).is_err());
    }

    proptest! {
        #[test]
        fn every_format_reproduces_the_same_bits(
            bits in proptest::collection::btree_set(0u32..60, 0..30)
        ) {
            let sparse: Vec<u32> = bits.into_iter().collect();
            let source = Sdr::from_sparse(&[3, 4, 5], &sparse).unwrap();

            let mut from_dense = Sdr::new(&[3, 4, 5]).unwrap();
            from_dense.set_dense(&source.get_dense()).unwrap();
            let mut from_coordinates = Sdr::new(&[3, 4, 5]).unwrap();
            from_coordinates.set_coordinates(&source.get_coordinates()).unwrap();

            let mut buffer = Vec::new();
            source.save(&mut buffer).unwrap();
            let loaded = Sdr::load(&mut TokenReader::new(Cursor::new(buffer))).unwrap();

            prop_assert_eq!(&*from_dense.get_sparse(), sparse.as_slice());
            prop_assert_eq!(&*from_coordinates.get_sparse(), sparse.as_slice());
            prop_assert_eq!(&*loaded.get_sparse(), sparse.as_slice());
        }
    }
}
