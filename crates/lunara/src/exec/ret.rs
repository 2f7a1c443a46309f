//! The return buffer: multi-value plumbing and tail-call requests.
//!
//! One buffer per call. Every function's results land here; callers read
//! them out, and a pending tail call is flagged rather than performed so
//! the executor can replace the current frame instead of growing the stack.
//! Five slots are inline; longer lists spill to the heap.

use smallvec::SmallVec;

use crate::value::LuaValue;

/// Inline capacity of the buffer.
const INLINE: usize = 5;

/// A mutable holder for the last call's return list and a possible
/// tail-call target.
#[derive(Debug, Default)]
pub struct ReturnBuffer {
    values: SmallVec<[LuaValue; INLINE]>,
    call_target: Option<LuaValue>,
}

impl ReturnBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with the given values, clearing any call flag.
    pub fn set_to(&mut self, values: impl IntoIterator<Item = LuaValue>) {
        self.values.clear();
        self.values.extend(values);
        self.call_target = None;
    }

    /// Replaces the contents with a slice's values.
    pub fn set_to_contents_of(&mut self, values: &[LuaValue]) {
        self.set_to(values.iter().cloned());
    }

    /// Requests a call: records the target and its arguments and raises the
    /// call flag. The executor honours it by dispatching `target` in place
    /// of returning.
    pub fn set_to_call(&mut self, target: LuaValue, args: impl IntoIterator<Item = LuaValue>) {
        self.values.clear();
        self.values.extend(args);
        self.call_target = Some(target);
    }

    /// Requests a call with arguments from a slice.
    pub fn set_to_call_with_contents_of(&mut self, target: LuaValue, args: &[LuaValue]) {
        self.set_to_call(target, args.iter().cloned());
    }

    /// Whether a tail-call request is pending.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.call_target.is_some()
    }

    /// Consumes a pending call request.
    ///
    /// # Panics
    /// Panics if no call is pending; callers check [`Self::is_call`].
    #[must_use]
    pub fn take_call(&mut self) -> (LuaValue, SmallVec<[LuaValue; INLINE]>) {
        let target = self.call_target.take().expect("take_call without a pending call");
        (target, std::mem::take(&mut self.values))
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// The value at `index`, nil past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> LuaValue {
        self.values.get(index).cloned().unwrap_or(LuaValue::Nil)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[LuaValue] {
        &self.values
    }

    /// Copies the contents out as a plain vector.
    #[must_use]
    pub fn get_as_array(&self) -> Vec<LuaValue> {
        self.values.to_vec()
    }

    /// Moves the contents out, leaving the buffer empty.
    #[must_use]
    pub fn take_values(&mut self) -> SmallVec<[LuaValue; INLINE]> {
        self.call_target = None;
        std::mem::take(&mut self.values)
    }

    /// Inserts a value at the front; `pcall` prefixes its success flag this
    /// way.
    pub fn prepend(&mut self, value: LuaValue) {
        self.values.insert(0, value);
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.call_target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_back() {
        let mut buffer = ReturnBuffer::new();
        buffer.set_to([LuaValue::Integer(1), LuaValue::Integer(2)]);
        assert_eq!(buffer.size(), 2);
        assert!(buffer.get(0).raw_eq(&LuaValue::Integer(1)));
        assert!(buffer.get(5).is_nil());
        assert!(!buffer.is_call());
    }

    #[test]
    fn call_flag_round_trip() {
        let mut buffer = ReturnBuffer::new();
        buffer.set_to_call(LuaValue::Integer(9), [LuaValue::Boolean(true)]);
        assert!(buffer.is_call());
        let (target, args) = buffer.take_call();
        assert!(target.raw_eq(&LuaValue::Integer(9)));
        assert_eq!(args.len(), 1);
        assert!(!buffer.is_call());
    }

    #[test]
    fn spill_past_inline_capacity() {
        let mut buffer = ReturnBuffer::new();
        buffer.set_to((0..20).map(LuaValue::Integer));
        assert_eq!(buffer.size(), 20);
        assert!(buffer.get(19).raw_eq(&LuaValue::Integer(19)));
    }

    #[test]
    fn setting_values_clears_a_pending_call() {
        let mut buffer = ReturnBuffer::new();
        buffer.set_to_call(LuaValue::Integer(1), []);
        buffer.set_to([LuaValue::Nil]);
        assert!(!buffer.is_call());
    }
}
