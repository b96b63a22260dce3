//! Pattern parameter tags and typed routing parameters.
//!
//! A route pattern's placeholders are encoded as a base-6 digit sequence
//! packed into a `u64`: 1 = `<int>`, 2 = `<uint>`, 3 = `<float>`/`<double>`,
//! 4 = `<str>`/`<string>`, 5 = `<path>`, with the first placeholder in the
//! least significant digit and `0` meaning "no parameters".
//!
//! [`parameter_tag`] is a `const fn`: the [`route!`](crate::route) macro
//! evaluates it in const context, so a malformed pattern literal fails the
//! build, which is also where the compile-time tag for the registered rule
//! comes from. Dynamic rules run the same code at `validate()` time.

use std::rc::Rc;

use crate::request::Request;
use crate::response::AsyncResponse;

/// Computes the packed parameter tag of a route pattern.
///
/// Evaluable in const context; panics (at compile time when used through
/// [`route!`](crate::route)) on unbalanced brackets or unknown placeholder
/// names.
#[allow(clippy::panic)]
#[must_use]
pub const fn parameter_tag(pattern: &str) -> u64 {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut tag = 0u64;
    let mut place = 1u64;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => {
                let digit = if starts_with(bytes, i, b"<int>") {
                    1
                } else if starts_with(bytes, i, b"<uint>") {
                    2
                } else if starts_with(bytes, i, b"<float>") || starts_with(bytes, i, b"<double>") {
                    3
                } else if starts_with(bytes, i, b"<str>") || starts_with(bytes, i, b"<string>") {
                    4
                } else if starts_with(bytes, i, b"<path>") {
                    5
                } else {
                    panic!("invalid parameter type in route pattern");
                };
                tag += digit * place;
                place *= 6;
                i = find_closing(bytes, i) + 1;
            }
            b'>' => panic!("unmatched '>' in route pattern"),
            _ => i += 1,
        }
    }
    tag
}

#[allow(clippy::panic)]
const fn find_closing(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        if bytes[i] == b'>' {
            return i;
        }
        i += 1;
    }
    panic!("unmatched '<' in route pattern");
}

const fn starts_with(bytes: &[u8], at: usize, pat: &[u8]) -> bool {
    if at + pat.len() > bytes.len() {
        return false;
    }
    let mut k = 0;
    while k < pat.len() {
        if bytes[at + k] != pat[k] {
            return false;
        }
        k += 1;
    }
    true
}

/// Packs per-argument digits (pattern order, first argument first) into a
/// tag.
#[must_use]
pub const fn pack_tag(digits: &[u64]) -> u64 {
    let mut tag = 0u64;
    let mut i = digits.len();
    while i > 0 {
        i -= 1;
        tag = tag * 6 + digits[i];
    }
    tag
}

/// Two tags are compatible iff their digit sequences agree after
/// collapsing `<path>` (5) into `<str>` (4): a rest-of-path parameter is
/// surfaced to the handler as a plain string.
#[must_use]
pub const fn tags_compatible(a: u64, b: u64) -> bool {
    let mut a = a;
    let mut b = b;
    loop {
        if a == 0 && b == 0 {
            return true;
        }
        let mut da = a % 6;
        let mut db = b % 6;
        if da == 5 {
            da = 4;
        }
        if db == 5 {
            db = 4;
        }
        if da != db {
            return false;
        }
        a /= 6;
        b /= 6;
    }
}

/// Decoded parameter values of one matched request, split per type in
/// pattern order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoutingParams {
    pub ints: Vec<i64>,
    pub uints: Vec<u64>,
    pub doubles: Vec<f64>,
    pub strings: Vec<String>,
}

/// Per-type read cursor used when projecting [`RoutingParams`] onto a
/// handler's argument list.
#[derive(Debug, Default)]
pub struct ParamCursor {
    int: usize,
    uint: usize,
    double: usize,
    string: usize,
}

/// A handler argument type decodable from a route parameter.
pub trait RouteParam: Sized + 'static {
    /// The base-6 digit this type reduces to.
    const DIGIT: u64;

    fn extract(params: &RoutingParams, cursor: &mut ParamCursor) -> Self;
}

impl RouteParam for i64 {
    const DIGIT: u64 = 1;

    fn extract(params: &RoutingParams, cursor: &mut ParamCursor) -> Self {
        let value = params.ints[cursor.int];
        cursor.int += 1;
        value
    }
}

impl RouteParam for u64 {
    const DIGIT: u64 = 2;

    fn extract(params: &RoutingParams, cursor: &mut ParamCursor) -> Self {
        let value = params.uints[cursor.uint];
        cursor.uint += 1;
        value
    }
}

impl RouteParam for f64 {
    const DIGIT: u64 = 3;

    fn extract(params: &RoutingParams, cursor: &mut ParamCursor) -> Self {
        let value = params.doubles[cursor.double];
        cursor.double += 1;
        value
    }
}

impl RouteParam for String {
    const DIGIT: u64 = 4;

    fn extract(params: &RoutingParams, cursor: &mut ParamCursor) -> Self {
        let value = params.strings[cursor.string].clone();
        cursor.string += 1;
        value
    }
}

/// The argument pack of a route handler, reduced to its packed tag.
pub trait ParamPack: 'static {
    const TAG: u64;
}

/// A callable bindable as a route handler: `(&Request, Rc<AsyncResponse>)`
/// followed by zero to five typed parameters in pattern order.
pub trait RouteHandler<Args: ParamPack>: 'static {
    fn invoke(&self, req: &Request, res: Rc<AsyncResponse>, params: &RoutingParams);
}

macro_rules! impl_route_handler {
    ($($ty:ident),*) => {
        impl<$($ty: RouteParam),*> ParamPack for ($($ty,)*) {
            const TAG: u64 = pack_tag(&[$($ty::DIGIT),*]);
        }

        impl<F $(, $ty)*> RouteHandler<($($ty,)*)> for F
        where
            F: Fn(&Request, Rc<AsyncResponse>, $($ty),*) + 'static,
            $($ty: RouteParam,)*
        {
            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn invoke(&self, req: &Request, res: Rc<AsyncResponse>, params: &RoutingParams) {
                let mut cursor = ParamCursor::default();
                let ($($ty,)*) = ($(<$ty as RouteParam>::extract(params, &mut cursor),)*);
                (self)(req, res $(, $ty)*)
            }
        }
    };
}

impl_route_handler!();
impl_route_handler!(A);
impl_route_handler!(A, B);
impl_route_handler!(A, B, C);
impl_route_handler!(A, B, C, D);
impl_route_handler!(A, B, C, D, E);
