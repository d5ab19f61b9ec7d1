// QChan Core Library implementing elkrem-revoked payment channels
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Declarative message schema.
//!
//! A single field list drives the struct definition, its encoder, its
//! decoder and the total encoded length, so the three can never disagree.

/// Declares a fixed-layout wire message.
///
/// An optional trailing `display("...", field, ...);` clause implements
/// `Display` with the listed fields as positional arguments.
///
/// ```
/// # #[macro_use] extern crate qchan_encoding;
/// # use qchan_encoding::{FixedSize, WireDecode, WireEncode};
/// wire_message! {
///     /// Example message
///     pub struct Ping {
///         pub nonce: u32,
///         pub token: [u8; 8],
///     }
///     display("ping({})", nonce);
/// }
///
/// # fn main() {
/// assert_eq!(Ping::LEN, 12);
/// let ping = Ping { nonce: 7, token: [1; 8] };
/// assert_eq!(ping.to_string(), "ping(7)");
/// assert_eq!(Ping::wire_deserialize(ping.wire_serialize()), Ok(ping));
/// # }
/// ```
#[macro_export]
macro_rules! wire_message {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
        $( display($fmt:literal $(, $arg:ident)* $(,)?); )?
    ) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Debug)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )*
        }

        impl $crate::FixedSize for $name {
            const LEN: usize = 0 $( + <$ty as $crate::FixedSize>::LEN )*;
        }

        impl $crate::WireEncode for $name {
            #[allow(unused_mut, unused_variables)]
            fn wire_encode<E: ::std::io::Write>(
                &self,
                mut e: E,
            ) -> Result<usize, ::std::io::Error> {
                let mut len = 0usize;
                $( len += $crate::WireEncode::wire_encode(&self.$field, &mut e)?; )*
                Ok(len)
            }
        }

        impl $crate::WireDecode for $name {
            #[allow(unused_mut, unused_variables)]
            fn wire_decode<D: ::std::io::Read>(
                mut d: D,
            ) -> Result<Self, $crate::Error> {
                Ok($name {
                    $( $field: $crate::WireDecode::wire_decode(&mut d)?, )*
                })
            }
        }

        $(
            impl ::core::fmt::Display for $name {
                fn fmt(
                    &self,
                    f: &mut ::core::fmt::Formatter<'_>,
                ) -> ::core::fmt::Result {
                    write!(f, $fmt $(, self.$arg)*)
                }
            }
        )?
    };
}
