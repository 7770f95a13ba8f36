//! Call shapes and the generic trampolines that stand in for intercepted
//! functions.
//!
//! A trampoline is monomorphized per (owner, signature, ordinal). The
//! ordinal is a const parameter, so "the Nth interception of this shape" is
//! baked into the redirect's address and needs no runtime self-discovery.

use core::any::Any;
use std::hint::black_box;
use std::sync::Arc;

use super::arguments::{Argument, ArgumentList};
use super::dispatch;
use crate::types::{TypeKey, Value};

/// Interceptions per shape key; one trampoline instance exists per ordinal.
pub const MAX_ORDINALS: usize = 8;

/// The `self` side of a call: `()` for free functions, `Arc<S>` for methods.
pub trait Receiver: Send + Sync + 'static {
    fn receiver_type() -> Option<TypeKey>;

    /// Entry for the scoped-instance map, so the callee sees its own receiver.
    fn scoped(&self) -> Option<(TypeKey, Value)>;

    /// What a void call injects into.
    fn injection_target(&self) -> Option<(&dyn Any, TypeKey)>;
}

impl Receiver for () {
    fn receiver_type() -> Option<TypeKey> {
        None
    }

    fn scoped(&self) -> Option<(TypeKey, Value)> {
        None
    }

    fn injection_target(&self) -> Option<(&dyn Any, TypeKey)> {
        None
    }
}

impl<S: Send + Sync + 'static> Receiver for Arc<S> {
    fn receiver_type() -> Option<TypeKey> {
        Some(TypeKey::of::<S>())
    }

    fn scoped(&self) -> Option<(TypeKey, Value)> {
        Some((TypeKey::of::<S>(), self.clone() as Value))
    }

    fn injection_target(&self) -> Option<(&dyn Any, TypeKey)> {
        Some((self.as_ref() as &dyn Any, TypeKey::of::<S>()))
    }
}

/// A compiled function pointer type that can be intercepted.
///
/// Implemented for `fn(A0, .., An) -> R` and for
/// `Method<fn(&Arc<S>, A0, .., An) -> R>`, with n up to 9.
pub trait Signature: Copy + Send + Sync + 'static {
    type Receiver: Receiver;
    type Arguments: ArgumentList;
    type Output: 'static;

    fn entry(self) -> usize;

    /// Calls the function itself, never a cached copy of its address.
    fn call(self, receiver: &Self::Receiver, arguments: Self::Arguments) -> Self::Output;

    /// The trampoline for interception number `ordinal` of this shape on
    /// owner `O`, or `None` past [`MAX_ORDINALS`].
    fn redirect<O: ?Sized + 'static>(ordinal: usize) -> Option<Self>;

    fn receiver_type() -> Option<TypeKey> {
        <Self::Receiver as Receiver>::receiver_type()
    }

    fn parameter_types() -> Vec<TypeKey> {
        <Self::Arguments as ArgumentList>::parameter_types()
    }
}

/// An instance method taking `self: &Arc<Self>`.
///
/// Wrapping keeps method pointers apart from free functions of the same
/// arity.
#[derive(Clone, Copy)]
pub struct Method<F>(pub F);

macro_rules! signatures {
    ($free:ident, $method:ident; $($A:ident $a:ident),*) => {
        fn $free<O: ?Sized + 'static, $($A: Argument,)* R: 'static, const N: usize>($($a: $A),*) -> R {
            dispatch::<O, fn($($A),*) -> R>(N, &(), ($($a,)*))
        }

        fn $method<O: ?Sized + 'static, S: Send + Sync + 'static, $($A: Argument,)* R: 'static, const N: usize>(
            this: &Arc<S>,
            $($a: $A),*
        ) -> R {
            dispatch::<O, Method<fn(&Arc<S>, $($A),*) -> R>>(N, this, ($($a,)*))
        }

        impl<$($A: Argument,)* R: 'static> Signature for fn($($A),*) -> R {
            type Receiver = ();
            type Arguments = ($($A,)*);
            type Output = R;

            fn entry(self) -> usize {
                self as usize
            }

            fn call(self, _receiver: &(), ($($a,)*): Self::Arguments) -> R {
                (black_box(self))($($a),*)
            }

            fn redirect<O: ?Sized + 'static>(ordinal: usize) -> Option<Self> {
                let f: Self = match ordinal {
                    0 => $free::<O, $($A,)* R, 0>,
                    1 => $free::<O, $($A,)* R, 1>,
                    2 => $free::<O, $($A,)* R, 2>,
                    3 => $free::<O, $($A,)* R, 3>,
                    4 => $free::<O, $($A,)* R, 4>,
                    5 => $free::<O, $($A,)* R, 5>,
                    6 => $free::<O, $($A,)* R, 6>,
                    7 => $free::<O, $($A,)* R, 7>,
                    _ => return None,
                };
                Some(f)
            }
        }

        impl<S: Send + Sync + 'static, $($A: Argument,)* R: 'static> Signature for Method<fn(&Arc<S>, $($A),*) -> R> {
            type Receiver = Arc<S>;
            type Arguments = ($($A,)*);
            type Output = R;

            fn entry(self) -> usize {
                self.0 as usize
            }

            fn call(self, receiver: &Arc<S>, ($($a,)*): Self::Arguments) -> R {
                (black_box(self.0))(receiver, $($a),*)
            }

            fn redirect<O: ?Sized + 'static>(ordinal: usize) -> Option<Self> {
                let f: fn(&Arc<S>, $($A),*) -> R = match ordinal {
                    0 => $method::<O, S, $($A,)* R, 0>,
                    1 => $method::<O, S, $($A,)* R, 1>,
                    2 => $method::<O, S, $($A,)* R, 2>,
                    3 => $method::<O, S, $($A,)* R, 3>,
                    4 => $method::<O, S, $($A,)* R, 4>,
                    5 => $method::<O, S, $($A,)* R, 5>,
                    6 => $method::<O, S, $($A,)* R, 6>,
                    7 => $method::<O, S, $($A,)* R, 7>,
                    _ => return None,
                };
                Some(Method(f))
            }
        }
    };
}

signatures!(free0, method0;);
signatures!(free1, method1; A0 a0);
signatures!(free2, method2; A0 a0, A1 a1);
signatures!(free3, method3; A0 a0, A1 a1, A2 a2);
signatures!(free4, method4; A0 a0, A1 a1, A2 a2, A3 a3);
signatures!(free5, method5; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
signatures!(free6, method6; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
signatures!(free7, method7; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
signatures!(free8, method8; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);
signatures!(free9, method9; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7, A8 a8);
