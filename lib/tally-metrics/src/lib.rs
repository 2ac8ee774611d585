//! Helpers for declaring and testing metrics emitted through the `metrics` facade.

mod macros;

#[cfg(any(test, feature = "test"))]
pub mod test;

/// Converts label values into `SharedString`.
///
/// Implemented for everything that implements `Display`, so `static_metrics!` can accept label values of any printable
/// type. There should be no need to implement this by hand.
pub trait LabelValue {
    /// Renders the value as a label string.
    fn to_label_value(&self) -> ::metrics::SharedString;
}

impl<T> LabelValue for T
where
    T: std::fmt::Display,
{
    fn to_label_value(&self) -> ::metrics::SharedString {
        self.to_string().into()
    }
}
