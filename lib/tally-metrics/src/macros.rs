#[doc(hidden)]
#[macro_export]
macro_rules! __metric_handle {
    (counter) => {
        ::metrics::Counter
    };
    (gauge) => {
        ::metrics::Gauge
    };
    (histogram) => {
        ::metrics::Histogram
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __register_handle {
    (counter, $name:expr, $labels:expr) => {
        ::metrics::counter!($name, $labels)
    };
    (gauge, $name:expr, $labels:expr) => {
        ::metrics::gauge!($name, $labels)
    };
    (histogram, $name:expr, $labels:expr) => {
        ::metrics::histogram!($name, $labels)
    };
    ($other:ident, $name:expr, $labels:expr) => {
        compile_error!(concat!(
            "unsupported metric kind `",
            stringify!($other),
            "`: expected `counter`, `gauge`, or `histogram`"
        ))
    };
}

/// Declares a container struct holding a fixed set of pre-registered metrics.
///
/// Every metric is registered once, when the container is constructed, under the name `<prefix>_<metric>` and with the
/// labels passed to the generated `new` constructor. Call sites then go through an accessor named after the metric, so
/// metric names only ever appear in the declaration.
///
/// Labels are optional. When present, each one is declared with a name and a type, and the generated constructor takes
/// one argument per label in declaration order. Label values only need to implement `Display`.
///
/// ## Example
///
/// ```rust
/// # use tally_metrics::static_metrics;
/// static_metrics!(
///    name => PoolMetrics,
///    prefix => pool,
///    labels => [pool_id: String],
///    metrics => [
///        counter(grants_total),
///        gauge(units_in_use),
///    ],
/// );
///
/// let metrics = PoolMetrics::new("trunk-1".to_string());
/// metrics.grants_total().increment(1);
/// metrics.units_in_use().set(3.0);
/// ```
#[macro_export]
macro_rules! static_metrics {
    (name => $name:ident, prefix => $prefix:ident, metrics => [$($kind:ident($metric:ident)),+ $(,)?] $(,)?) => {
        $crate::static_metrics!(name => $name, prefix => $prefix, labels => [], metrics => [$($kind($metric)),+]);
    };
    (name => $name:ident, prefix => $prefix:ident, labels => [$($label:ident: $label_ty:ty),* $(,)?], metrics => [$($kind:ident($metric:ident)),+ $(,)?] $(,)?) => {
        #[derive(Clone)]
        struct $name {
            $(
                $metric: $crate::__metric_handle!($kind),
            )+
        }

        impl $name {
            pub fn new($($label: $label_ty),*) -> Self {
                let labels: ::std::vec::Vec<::metrics::Label> = ::std::vec![
                    $(
                        ::metrics::Label::new(stringify!($label), $crate::LabelValue::to_label_value(&$label)),
                    )*
                ];

                Self {
                    $(
                        $metric: $crate::__register_handle!(
                            $kind,
                            concat!(stringify!($prefix), "_", stringify!($metric)),
                            labels.iter()
                        ),
                    )+
                }
            }

            $(
                pub fn $metric(&self) -> &$crate::__metric_handle!($kind) {
                    &self.$metric
                }
            )+
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}
