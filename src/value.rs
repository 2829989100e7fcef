//! A uniform carrier for "zero or more `T`s, or nothing at all" (§9
//! void-typed specialization), so the engine can be written once against
//! [`ValueCell`] instead of specializing every path for `T = ()`.

/// Holds the result(s) of a shared state: void-typed states store nothing,
/// typed states store an ordered list of values (§3 `results`).
#[derive(Debug, Clone)]
pub(crate) enum ValueCell<T> {
    /// No results recorded yet.
    Empty,
    /// One or more results, in completion order.
    Values(Vec<T>),
}

impl<T> Default for ValueCell<T> {
    fn default() -> Self {
        ValueCell::Empty
    }
}

impl<T> ValueCell<T> {
    pub(crate) fn push(&mut self, value: T) {
        match self {
            ValueCell::Empty => *self = ValueCell::Values(vec![value]),
            ValueCell::Values(v) => v.push(value),
        }
    }

    pub(crate) fn extend(&mut self, values: Vec<T>) {
        match self {
            ValueCell::Empty => *self = ValueCell::Values(values),
            ValueCell::Values(v) => v.extend(values),
        }
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        match self {
            ValueCell::Empty => &[],
            ValueCell::Values(v) => v,
        }
    }

    pub(crate) fn into_vec(self) -> Vec<T> {
        match self {
            ValueCell::Empty => Vec::new(),
            ValueCell::Values(v) => v,
        }
    }

    /// The last reported value, if any (the conventional single "result").
    pub(crate) fn last(&self) -> Option<&T> {
        self.as_slice().last()
    }
}

/// Marker for the void-typed case of the carrier; `Handle<Void>` is the
/// read side of a state that never reports a result payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Void;
