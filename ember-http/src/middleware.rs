//! Statically composed middleware.
//!
//! An application is parameterized by a tuple of middleware types. Each
//! middleware declares a per-request [`Context`](Middleware::Context)
//! slot; the tuple of slots forms one flat block allocated per request and
//! handed through the chain. `before_handle` hooks run in registration
//! order until one completes the response; `after_handle` hooks run in
//! reverse over exactly the prefix that executed.
//!
//! Later middleware can read the state earlier middleware left behind
//! through the [`Prior`] view, a type-keyed window over the preceding
//! context slots.

use std::any::Any;

use crate::request::Request;
use crate::response::Response;

/// An interceptor wrapped around every routed request.
///
/// Both hooks default to no-ops, so a middleware only implements the side
/// it cares about. Exactly one instance of each middleware type lives in
/// the application; everything request-scoped belongs in
/// [`Context`](Middleware::Context).
pub trait Middleware: 'static {
    /// Per-request state slot, default-initialized before the chain runs.
    type Context: Default + 'static;

    /// Runs before routing. Completing the response here (set a status,
    /// then [`Response::end`]) short-circuits the rest of the chain and
    /// the handler.
    fn before_handle(
        &self,
        req: &mut Request,
        res: &mut Response,
        ctx: &mut Self::Context,
        prior: &Prior<'_>,
    ) {
        let _ = (req, res, ctx, prior);
    }

    /// Runs after the handler (or the short-circuiting middleware)
    /// completed the response, in reverse registration order.
    fn after_handle(
        &self,
        req: &mut Request,
        res: &mut Response,
        ctx: &mut Self::Context,
        prior: &Prior<'_>,
    ) {
        let _ = (req, res, ctx, prior);
    }
}

/// Read-only view over the context slots of middleware that ran earlier
/// in the chain, keyed by context type.
pub struct Prior<'a> {
    slots: &'a [&'a dyn Any],
}

impl<'a> Prior<'a> {
    fn new(slots: &'a [&'a dyn Any]) -> Self {
        Self { slots }
    }

    /// The context of an earlier middleware, looked up by its context
    /// type.
    #[must_use]
    pub fn get<C: Any>(&self) -> Option<&'a C> {
        self.slots.iter().find_map(|slot| slot.downcast_ref())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// An ordered middleware stack; implemented for tuples of [`Middleware`]
/// up to arity eight.
pub trait MiddlewareChain: 'static {
    /// The flat per-request context block: one slot per middleware, in
    /// registration order.
    type Context: Default + 'static;

    /// Runs the before hooks in order. Returns `true` when a middleware
    /// completed the response; the after hooks of the executed prefix
    /// have then already run in reverse order.
    fn run_before(&self, req: &mut Request, res: &mut Response, ctx: &mut Self::Context) -> bool;

    /// Runs every after hook in reverse registration order. Call only
    /// when [`run_before`](Self::run_before) returned `false`, once the
    /// handler completed the response.
    fn run_after(&self, req: &mut Request, res: &mut Response, ctx: &mut Self::Context);

    /// The process-wide instance of a middleware in this stack, by type.
    fn find<T: Any>(&self) -> Option<&T>;
}

impl MiddlewareChain for () {
    type Context = ();

    fn run_before(&self, _req: &mut Request, _res: &mut Response, _ctx: &mut ()) -> bool {
        false
    }

    fn run_after(&self, _req: &mut Request, _res: &mut Response, _ctx: &mut ()) {}

    fn find<T: Any>(&self) -> Option<&T> {
        None
    }
}

// Builds a `Prior` over an accumulator of (middleware, context) pairs.
macro_rules! prior_of {
    ($(($M:ident, $c:ident))*) => {
        Prior::new(&[$(&*$c as &dyn Any),*])
    };
}

// Runs the after hooks of an already-reversed accumulator, giving each
// middleware the prior view over the pairs behind it.
macro_rules! run_afters {
    ($req:ident, $res:ident, []) => {};
    ($req:ident, $res:ident, [($M:ident, $c:ident) $($rest:tt)*]) => {
        $M.after_handle($req, $res, $c, &prior_of!($($rest)*));
        run_afters!($req, $res, [$($rest)*]);
    };
}

// Descends the before hooks, accumulating executed pairs in reverse so a
// short-circuit can unwind them without re-reversal.
macro_rules! run_befores {
    ($req:ident, $res:ident, [$($done:tt)*], []) => { false };
    ($req:ident, $res:ident, [$($done:tt)*], [($M:ident, $c:ident) $($rest:tt)*]) => {{
        $M.before_handle($req, $res, $c, &prior_of!($($done)*));
        if $res.is_completed() {
            $M.after_handle($req, $res, $c, &prior_of!($($done)*));
            run_afters!($req, $res, [$($done)*]);
            true
        } else {
            run_befores!($req, $res, [($M, $c) $($done)*], [$($rest)*])
        }
    }};
}

// Reverses the pair list, then delegates to `run_afters`.
macro_rules! run_afters_reversed {
    ($req:ident, $res:ident, [$($acc:tt)*], []) => {
        run_afters!($req, $res, [$($acc)*])
    };
    ($req:ident, $res:ident, [$($acc:tt)*], [($M:ident, $c:ident) $($rest:tt)*]) => {
        run_afters_reversed!($req, $res, [($M, $c) $($acc)*], [$($rest)*])
    };
}

macro_rules! impl_middleware_chain {
    ($(($M:ident, $c:ident)),+) => {
        impl<$($M: Middleware),+> MiddlewareChain for ($($M,)+) {
            type Context = ($($M::Context,)+);

            #[allow(non_snake_case)]
            fn run_before(
                &self,
                req: &mut Request,
                res: &mut Response,
                ctx: &mut Self::Context,
            ) -> bool {
                let ($($M,)+) = self;
                let ($($c,)+) = ctx;
                run_befores!(req, res, [], [$(($M, $c))+])
            }

            #[allow(non_snake_case)]
            fn run_after(
                &self,
                req: &mut Request,
                res: &mut Response,
                ctx: &mut Self::Context,
            ) {
                let ($($M,)+) = self;
                let ($($c,)+) = ctx;
                run_afters_reversed!(req, res, [], [$(($M, $c))+]);
            }

            #[allow(non_snake_case)]
            fn find<T: Any>(&self) -> Option<&T> {
                let ($($M,)+) = self;
                $(
                    if let Some(found) = ($M as &dyn Any).downcast_ref::<T>() {
                        return Some(found);
                    }
                )+
                None
            }
        }
    };
}

impl_middleware_chain!((M0, c0));
impl_middleware_chain!((M0, c0), (M1, c1));
impl_middleware_chain!((M0, c0), (M1, c1), (M2, c2));
impl_middleware_chain!((M0, c0), (M1, c1), (M2, c2), (M3, c3));
impl_middleware_chain!((M0, c0), (M1, c1), (M2, c2), (M3, c3), (M4, c4));
impl_middleware_chain!((M0, c0), (M1, c1), (M2, c2), (M3, c3), (M4, c4), (M5, c5));
impl_middleware_chain!(
    (M0, c0),
    (M1, c1),
    (M2, c2),
    (M3, c3),
    (M4, c4),
    (M5, c5),
    (M6, c6)
);
impl_middleware_chain!(
    (M0, c0),
    (M1, c1),
    (M2, c2),
    (M3, c3),
    (M4, c4),
    (M5, c5),
    (M6, c6),
    (M7, c7)
);
