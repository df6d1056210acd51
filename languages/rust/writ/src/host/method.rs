//! Traits to help with passing around methods of arbitrary arities
//! and to help downcast+convert the arguments.

/// An alternate version of the `Fn` trait
/// which encodes the types of the arguments
/// in a single type - a tuple.
pub trait Function<Args = ()>: Send + Sync + 'static {
    type Result: 'static;

    fn invoke(&self, args: Args) -> Self::Result;
}

/// Similar to a `Function` but also takes an explicit `receiver`
/// parameter than is the first argument of the call (i.e. the `self` param);
pub trait Method<Receiver, Args = ()>: Send + Sync + 'static {
    type Result: 'static;

    fn invoke(&self, receiver: &Receiver, args: Args) -> Self::Result;
}

macro_rules! impl_function_and_method {
    ($($arg:ident => $idx:tt),*) => {
        impl<$($arg,)* F, R: 'static> Function<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
        {
            type Result = R;

            #[allow(unused_variables)]
            fn invoke(&self, args: ($($arg,)*)) -> Self::Result {
                (self)($(args.$idx),*)
            }
        }

        impl<$($arg,)* F, R: 'static, Receiver> Method<Receiver, ($($arg,)*)> for F
        where
            F: Fn(&Receiver, $($arg),*) -> R + Send + Sync + 'static,
        {
            type Result = R;

            #[allow(unused_variables)]
            fn invoke(&self, receiver: &Receiver, args: ($($arg,)*)) -> Self::Result {
                (self)(receiver, $(args.$idx),*)
            }
        }
    };
}

impl_function_and_method!();
impl_function_and_method!(A => 0);
impl_function_and_method!(A => 0, B => 1);
impl_function_and_method!(A => 0, B => 1, C => 2);
impl_function_and_method!(A => 0, B => 1, C => 2, D => 3);
impl_function_and_method!(A => 0, B => 1, C => 2, D => 3, E => 4);
impl_function_and_method!(A => 0, B => 1, C => 2, D => 3, E => 4, G => 5);
impl_function_and_method!(A => 0, B => 1, C => 2, D => 3, E => 4, G => 5, H => 6);
impl_function_and_method!(A => 0, B => 1, C => 2, D => 3, E => 4, G => 5, H => 6, I => 7);
