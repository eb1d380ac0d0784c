use crate::{
    hierarchy::{Hierarchy, JAVA_IO_SERIALIZABLE, JAVA_LANG_CLONEABLE, JAVA_LANG_OBJECT},
    VerifyResult,
};
use ristretto_classfile::{BaseType, FieldType};
use std::fmt;

/// A type in the verifier's lattice.
///
/// Category 2 values (`long`, `double`) occupy two slots, the primary slot followed by a
/// `Long2`/`Double2` marker.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VerificationType {
    /// The "no value" type. As an expected type it accepts anything; it is also the
    /// return type of `void` methods.
    Bogus,
    /// An unusable slot.
    Top,
    Integer,
    Float,
    Long,
    /// The second slot of a `long`.
    Long2,
    Double,
    /// The second slot of a `double`.
    Double2,
    Null,
    /// A class, interface or array type by binary name. Arrays use their descriptor,
    /// e.g. `[I` or `[Ljava/lang/String;`.
    Reference(String),
    /// An object created by the `new` instruction at the given offset, not yet initialized.
    Uninitialized(u16),
    /// The receiver of a constructor before `this()` or `super()` was called.
    UninitializedThis,
    /// Accepts any single slot value. Only used as an expected type.
    Category1Check,
    /// Accepts the primary slot of a `long` or `double`. Only used as an expected type.
    Category2Check,
    /// Accepts any reference, including `null` and uninitialized objects. Only used as an
    /// expected type.
    ReferenceCheck,
}

impl VerificationType {
    /// Creates a reference type.
    pub fn reference<S: Into<String>>(name: S) -> Self {
        VerificationType::Reference(name.into())
    }

    /// Converts a field type to the type of its primary slot.
    pub fn from_field_type(field_type: &FieldType) -> Self {
        match field_type {
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(_) => VerificationType::Integer,
            FieldType::Object(class_name) => VerificationType::Reference(class_name.clone()),
            FieldType::Array(_) => {
                VerificationType::Reference(crate::method::field_descriptor(field_type))
            }
        }
    }

    /// Converts a field type to the one or two slots it occupies.
    pub(crate) fn slots_of(field_type: &FieldType) -> Vec<Self> {
        let primary = Self::from_field_type(field_type);
        match primary.second_half() {
            Some(second) => vec![primary, second],
            None => vec![primary],
        }
    }

    /// Returns the marker type of the second slot of a category 2 type.
    pub fn second_half(&self) -> Option<Self> {
        match self {
            VerificationType::Long => Some(VerificationType::Long2),
            VerificationType::Double => Some(VerificationType::Double2),
            _ => None,
        }
    }

    pub fn is_bogus(&self) -> bool {
        matches!(self, VerificationType::Bogus)
    }

    pub fn is_top(&self) -> bool {
        matches!(self, VerificationType::Top)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, VerificationType::Null)
    }

    /// Returns `true` for `null` and initialized references.
    pub fn is_reference(&self) -> bool {
        matches!(self, VerificationType::Null | VerificationType::Reference(_))
    }

    pub fn is_uninitialized(&self) -> bool {
        matches!(
            self,
            VerificationType::Uninitialized(_) | VerificationType::UninitializedThis
        )
    }

    pub fn is_uninitialized_this(&self) -> bool {
        matches!(self, VerificationType::UninitializedThis)
    }

    /// Returns `true` for values that occupy a single slot.
    pub fn is_category1(&self) -> bool {
        matches!(
            self,
            VerificationType::Top
                | VerificationType::Integer
                | VerificationType::Float
                | VerificationType::Null
                | VerificationType::Reference(_)
                | VerificationType::Uninitialized(_)
                | VerificationType::UninitializedThis
        )
    }

    /// Returns `true` for the primary slot of a `long` or `double`.
    pub fn is_category2(&self) -> bool {
        matches!(self, VerificationType::Long | VerificationType::Double)
    }

    /// Returns `true` for the second slot of a `long` or `double`.
    pub fn is_category2_2nd(&self) -> bool {
        matches!(self, VerificationType::Long2 | VerificationType::Double2)
    }

    /// The binary name of a reference type.
    pub fn name(&self) -> Option<&str> {
        match self {
            VerificationType::Reference(name) => Some(name),
            _ => None,
        }
    }

    /// Returns `true` for class and interface types, excluding arrays and `null`.
    pub fn is_object(&self) -> bool {
        self.name().is_some_and(|name| !name.starts_with('['))
    }

    /// Returns `true` for array types.
    pub fn is_array(&self) -> bool {
        self.name()
            .is_some_and(|name| name.len() >= 2 && name.starts_with('['))
    }

    /// Returns `true` for `null` and for arrays whose component descriptor starts with
    /// `descriptor`.
    fn is_x_array(&self, descriptor: u8) -> bool {
        self.is_null()
            || (self.is_array()
                && self
                    .name()
                    .is_some_and(|name| name.as_bytes().get(1) == Some(&descriptor)))
    }

    pub fn is_bool_array(&self) -> bool {
        self.is_x_array(b'Z')
    }

    pub fn is_byte_array(&self) -> bool {
        self.is_x_array(b'B')
    }

    pub fn is_char_array(&self) -> bool {
        self.is_x_array(b'C')
    }

    pub fn is_short_array(&self) -> bool {
        self.is_x_array(b'S')
    }

    pub fn is_int_array(&self) -> bool {
        self.is_x_array(b'I')
    }

    pub fn is_long_array(&self) -> bool {
        self.is_x_array(b'J')
    }

    pub fn is_float_array(&self) -> bool {
        self.is_x_array(b'F')
    }

    pub fn is_double_array(&self) -> bool {
        self.is_x_array(b'D')
    }

    /// Returns `true` for `null` and arrays of references.
    pub fn is_reference_array(&self) -> bool {
        self.is_x_array(b'L') || self.is_x_array(b'[')
    }

    /// The number of array dimensions, zero for anything but arrays.
    pub fn dimensions(&self) -> usize {
        self.name()
            .map_or(0, |name| name.bytes().take_while(|byte| *byte == b'[').count())
    }

    /// The component type of an array type.
    pub fn component(&self) -> Option<Self> {
        if !self.is_array() {
            return None;
        }
        let descriptor = &self.name()?[1..];
        match descriptor.as_bytes().first()? {
            b'[' => Some(VerificationType::reference(descriptor)),
            b'L' => descriptor
                .strip_prefix('L')
                .and_then(|name| name.strip_suffix(';'))
                .map(VerificationType::reference),
            b'J' => Some(VerificationType::Long),
            b'D' => Some(VerificationType::Double),
            b'F' => Some(VerificationType::Float),
            b'Z' | b'B' | b'C' | b'S' | b'I' => Some(VerificationType::Integer),
            _ => None,
        }
    }

    /// The offset of the `new` instruction that created an uninitialized object.
    pub fn bci(&self) -> Option<u16> {
        match self {
            VerificationType::Uninitialized(bci) => Some(*bci),
            _ => None,
        }
    }

    /// Returns `true` if a value of type `from` may be used where `self` is expected.
    ///
    /// # Errors
    /// If a class needed to answer the query cannot be resolved.
    pub(crate) fn is_assignable_from(
        &self,
        from: &VerificationType,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<bool> {
        if self == from || self.is_bogus() {
            return Ok(true);
        }
        match self {
            VerificationType::Category1Check => Ok(from.is_category1()),
            VerificationType::Category2Check => Ok(from.is_category2()),
            VerificationType::ReferenceCheck => Ok(from.is_reference() || from.is_uninitialized()),
            VerificationType::Reference(_) if from.is_reference() => {
                self.is_reference_assignable_from(from, hierarchy)
            }
            _ => Ok(false),
        }
    }

    fn is_reference_assignable_from(
        &self,
        from: &VerificationType,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<bool> {
        let (Some(name), Some(from_name)) = (self.name(), from.name()) else {
            // `null` is assignable to every reference.
            return Ok(from.is_null());
        };
        if name == from_name {
            return Ok(true);
        }

        if self.is_object() {
            if name == JAVA_LANG_OBJECT {
                return Ok(true);
            }
            // Interface conformance is checked at runtime, except for arrays which only
            // implement the two array interfaces.
            if hierarchy.is_interface(name)? {
                return Ok(!from.is_array()
                    || name == JAVA_LANG_CLONEABLE
                    || name == JAVA_IO_SERIALIZABLE);
            }
            if from.is_object() {
                return hierarchy.is_subclass_of(from_name, name);
            }
            return Ok(false);
        }

        if self.is_array() && from.is_array() {
            let this_component = &name[1..];
            let from_component = &from_name[1..];
            let is_reference = |descriptor: &str| descriptor.starts_with(['L', '[']);
            if !is_reference(this_component) || !is_reference(from_component) {
                return Ok(this_component == from_component);
            }
            return match (self.component(), from.component()) {
                (Some(this_component), Some(from_component)) => {
                    this_component.is_assignable_from(&from_component, hierarchy)
                }
                _ => Ok(false),
            };
        }
        Ok(false)
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationType::Bogus => write!(f, "bogus"),
            VerificationType::Top => write!(f, "top"),
            VerificationType::Integer => write!(f, "integer"),
            VerificationType::Float => write!(f, "float"),
            VerificationType::Long => write!(f, "long"),
            VerificationType::Long2 => write!(f, "long_2nd"),
            VerificationType::Double => write!(f, "double"),
            VerificationType::Double2 => write!(f, "double_2nd"),
            VerificationType::Null => write!(f, "null"),
            VerificationType::Reference(name) => write!(f, "'{name}'"),
            VerificationType::Uninitialized(bci) => write!(f, "uninitialized({bci})"),
            VerificationType::UninitializedThis => write!(f, "uninitializedThis"),
            VerificationType::Category1Check => write!(f, "category1_check"),
            VerificationType::Category2Check => write!(f, "category2_check"),
            VerificationType::ReferenceCheck => write!(f, "reference_check"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::ClassBuilder, ClassHierarchy, ClassModel};
    use VerificationType::*;

    fn class() -> ClassModel {
        ClassBuilder::new("pkg/Current").build()
    }

    fn resolver() -> ClassHierarchy {
        ClassHierarchy::default()
            .with_class("pkg/Animal", JAVA_LANG_OBJECT)
            .with_class("pkg/Dog", "pkg/Animal")
            .with_interface("pkg/Pet")
    }

    #[track_caller]
    fn assert_assignable(to: &VerificationType, from: &VerificationType, expected: bool) {
        let class = class();
        let resolver = resolver();
        let hierarchy = Hierarchy::new(&resolver, &class);
        assert_eq!(
            to.is_assignable_from(from, &hierarchy),
            Ok(expected),
            "{from} assignable to {to}"
        );
    }

    fn samples() -> Vec<VerificationType> {
        vec![
            Top,
            Integer,
            Float,
            Long,
            Long2,
            Double,
            Double2,
            Null,
            VerificationType::reference(JAVA_LANG_OBJECT),
            VerificationType::reference("pkg/Animal"),
            VerificationType::reference("pkg/Dog"),
            VerificationType::reference("pkg/Pet"),
            VerificationType::reference("[I"),
            VerificationType::reference("[Lpkg/Dog;"),
            Uninitialized(4),
            UninitializedThis,
        ]
    }

    #[test]
    fn test_assignability_is_reflexive() {
        for sample in samples() {
            assert_assignable(&sample, &sample, true);
        }
    }

    #[test]
    fn test_only_top_is_assignable_to_top() {
        for sample in samples() {
            assert_assignable(&Top, &sample, sample == Top);
        }
    }

    #[test]
    fn test_assignability_is_transitive() -> VerifyResult<()> {
        let class = class();
        let resolver = resolver();
        let hierarchy = Hierarchy::new(&resolver, &class);
        // Interfaces accept any object, so they are left out.
        let samples: Vec<_> = samples()
            .into_iter()
            .filter(|sample| sample.name() != Some("pkg/Pet"))
            .collect();
        for (a, b, c) in itertools::iproduct!(&samples, &samples, &samples) {
            if a.is_assignable_from(b, &hierarchy)? && b.is_assignable_from(c, &hierarchy)? {
                assert!(a.is_assignable_from(c, &hierarchy)?, "{c} -> {b} -> {a}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_null_is_assignable_to_references() {
        for sample in samples() {
            let expected = sample.is_reference();
            assert_assignable(&sample, &Null, expected);
        }
    }

    #[test]
    fn test_reference_assignability() {
        let object = VerificationType::reference(JAVA_LANG_OBJECT);
        let animal = VerificationType::reference("pkg/Animal");
        let dog = VerificationType::reference("pkg/Dog");
        let pet = VerificationType::reference("pkg/Pet");

        assert_assignable(&animal, &dog, true);
        assert_assignable(&object, &dog, true);
        assert_assignable(&dog, &animal, false);
        assert_assignable(&pet, &dog, true);
        assert_assignable(&pet, &VerificationType::reference("[I"), false);
        assert_assignable(
            &VerificationType::reference(JAVA_LANG_CLONEABLE),
            &VerificationType::reference("[I"),
            true,
        );
        assert_assignable(&object, &VerificationType::reference("[[J"), true);
        assert_assignable(&animal, &VerificationType::reference("[Lpkg/Dog;"), false);
    }

    #[test]
    fn test_array_assignability() {
        let animals = VerificationType::reference("[Lpkg/Animal;");
        let dogs = VerificationType::reference("[Lpkg/Dog;");
        let objects = VerificationType::reference("[Ljava/lang/Object;");

        assert_assignable(&animals, &dogs, true);
        assert_assignable(&dogs, &animals, false);
        assert_assignable(&objects, &VerificationType::reference("[[I"), true);
        assert_assignable(
            &VerificationType::reference("[I"),
            &VerificationType::reference("[B"),
            false,
        );
        assert_assignable(&objects, &VerificationType::reference("[I"), false);
    }

    #[test]
    fn test_uninitialized_assignability() {
        let object = VerificationType::reference(JAVA_LANG_OBJECT);
        assert_assignable(&object, &Uninitialized(3), false);
        assert_assignable(&object, &UninitializedThis, false);
        assert_assignable(&Uninitialized(3), &Uninitialized(4), false);
        assert_assignable(&ReferenceCheck, &Uninitialized(3), true);
        assert_assignable(&ReferenceCheck, &UninitializedThis, true);
        assert_assignable(&Category1Check, &UninitializedThis, true);
    }

    #[test]
    fn test_wildcards() {
        assert_assignable(&Category1Check, &Integer, true);
        assert_assignable(&Category1Check, &Long, false);
        assert_assignable(&Category1Check, &Long2, false);
        assert_assignable(&Category2Check, &Double, true);
        assert_assignable(&Category2Check, &Integer, false);
        assert_assignable(&ReferenceCheck, &Null, true);
        assert_assignable(&ReferenceCheck, &Integer, false);
        assert_assignable(&Bogus, &Double2, true);
        assert_assignable(&Integer, &Float, false);
    }

    #[test]
    fn test_array_predicates() {
        let ints = VerificationType::reference("[I");
        let strings = VerificationType::reference("[Ljava/lang/String;");
        let matrix = VerificationType::reference("[[J");

        assert!(ints.is_int_array());
        assert!(!ints.is_long_array());
        assert!(strings.is_reference_array());
        assert!(matrix.is_reference_array());
        assert!(!matrix.is_long_array());
        assert!(Null.is_int_array() && Null.is_reference_array());
        assert!(!VerificationType::reference("pkg/Dog").is_array());

        assert_eq!(matrix.dimensions(), 2);
        assert_eq!(matrix.component(), Some(VerificationType::reference("[J")));
        assert_eq!(
            strings.component(),
            Some(VerificationType::reference("java/lang/String"))
        );
        assert_eq!(ints.component(), Some(Integer));
        assert_eq!(VerificationType::reference("pkg/Dog").component(), None);
    }

    #[test]
    fn test_from_field_type() {
        use ristretto_classfile::{BaseType, FieldType};

        assert_eq!(
            VerificationType::slots_of(&FieldType::Base(BaseType::Long)),
            vec![Long, Long2]
        );
        assert_eq!(
            VerificationType::slots_of(&FieldType::Base(BaseType::Boolean)),
            vec![Integer]
        );
        assert_eq!(
            VerificationType::from_field_type(&FieldType::Array(Box::new(FieldType::Object(
                "java/lang/String".into()
            )))),
            VerificationType::reference("[Ljava/lang/String;")
        );
    }
}
