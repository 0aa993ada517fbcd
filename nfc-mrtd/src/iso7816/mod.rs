//! ISO/IEC 7816-4 command framing, the card abstraction and file access.


pub mod apdu;
pub mod card;
pub mod file;
