//! Typed characteristic access and declarative device models.

pub(crate) mod binding;
pub mod characteristic;
pub mod codec;
pub mod device;

pub use characteristic::{Availability, ChangeSubscription, Characteristic};
pub use codec::{ByteCodec, ByteReader, ByteWriter, CharacteristicValue};
pub use device::{
    CharacteristicDescription, DeviceDeclaration, DeviceDescription, DeviceModel, PeripheralAccessor,
    ServiceDeclaration, ServiceDescription,
};
