use crate::{ClassModel, VerificationError, VerifyResult};
use std::cell::RefCell;
use std::collections::HashMap;

pub(crate) const JAVA_LANG_OBJECT: &str = "java/lang/Object";
pub(crate) const JAVA_LANG_CLONEABLE: &str = "java/lang/Cloneable";
pub(crate) const JAVA_IO_SERIALIZABLE: &str = "java/io/Serializable";
pub(crate) const JAVA_LANG_THROWABLE: &str = "java/lang/Throwable";

/// Upper bound on the length of a superclass chain.
const MAX_HIERARCHY_DEPTH: usize = 1024;

/// What the verifier needs to know about a class it does not verify itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassHierarchyInfo {
    /// `true` for interfaces.
    pub is_interface: bool,
    /// The binary name of the superclass, `None` for `java/lang/Object` and interfaces
    /// that do not name one.
    pub super_class: Option<String>,
}

impl ClassHierarchyInfo {
    /// Describes a class extending `super_class`.
    pub fn class<S: Into<String>>(super_class: S) -> Self {
        Self {
            is_interface: false,
            super_class: Some(super_class.into()),
        }
    }

    /// Describes an interface.
    pub fn interface() -> Self {
        Self {
            is_interface: true,
            super_class: Some(JAVA_LANG_OBJECT.to_string()),
        }
    }
}

/// Answers subtype queries about classes by binary name.
///
/// Implementations are shared across every method of a verified class and may be
/// shared across threads by callers that verify classes in parallel.
pub trait ClassHierarchyResolver: Send + Sync {
    /// Returns the hierarchy information of `class_name`, or `None` if it is unknown.
    fn resolve(&self, class_name: &str) -> Option<ClassHierarchyInfo>;
}

impl<F> ClassHierarchyResolver for F
where
    F: Fn(&str) -> Option<ClassHierarchyInfo> + Send + Sync,
{
    fn resolve(&self, class_name: &str) -> Option<ClassHierarchyInfo> {
        self(class_name)
    }
}

/// An in-memory [`ClassHierarchyResolver`].
///
/// [`ClassHierarchy::default`] knows the platform classes the verifier itself refers to
/// (`Object`, `Throwable`, the common exception types, `String`, `Class`, the method
/// handle types and the array interfaces).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassHierarchy {
    classes: HashMap<String, ClassHierarchyInfo>,
}

impl ClassHierarchy {
    /// Creates a hierarchy that knows no classes at all.
    pub fn empty() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    /// Registers a class with the given superclass.
    pub fn with_class<S: Into<String>, T: Into<String>>(mut self, name: S, super_class: T) -> Self {
        self.classes
            .insert(name.into(), ClassHierarchyInfo::class(super_class));
        self
    }

    /// Registers an interface.
    pub fn with_interface<S: Into<String>>(mut self, name: S) -> Self {
        self.classes
            .insert(name.into(), ClassHierarchyInfo::interface());
        self
    }

    /// Registers the class described by `class`.
    pub fn insert_class_model(&mut self, class: &ClassModel) {
        self.classes
            .insert(class.this_class.clone(), class.hierarchy_info());
    }

    /// Registers a class by its hierarchy information.
    pub fn insert<S: Into<String>>(&mut self, name: S, info: ClassHierarchyInfo) {
        self.classes.insert(name.into(), info);
    }
}

impl Default for ClassHierarchy {
    fn default() -> Self {
        let mut hierarchy = Self::empty();
        hierarchy.insert(
            JAVA_LANG_OBJECT,
            ClassHierarchyInfo {
                is_interface: false,
                super_class: None,
            },
        );
        hierarchy
            .with_interface(JAVA_LANG_CLONEABLE)
            .with_interface(JAVA_IO_SERIALIZABLE)
            .with_interface("java/lang/CharSequence")
            .with_interface("java/lang/Comparable")
            .with_interface("java/lang/Runnable")
            .with_interface("java/lang/AutoCloseable")
            .with_class("java/lang/String", JAVA_LANG_OBJECT)
            .with_class("java/lang/Class", JAVA_LANG_OBJECT)
            .with_class("java/lang/Number", JAVA_LANG_OBJECT)
            .with_class("java/lang/Integer", "java/lang/Number")
            .with_class("java/lang/Long", "java/lang/Number")
            .with_class("java/lang/StringBuilder", JAVA_LANG_OBJECT)
            .with_class("java/lang/invoke/MethodHandle", JAVA_LANG_OBJECT)
            .with_class("java/lang/invoke/MethodType", JAVA_LANG_OBJECT)
            .with_class(JAVA_LANG_THROWABLE, JAVA_LANG_OBJECT)
            .with_class("java/lang/Exception", JAVA_LANG_THROWABLE)
            .with_class("java/lang/Error", JAVA_LANG_THROWABLE)
            .with_class("java/lang/RuntimeException", "java/lang/Exception")
            .with_class("java/lang/IllegalStateException", "java/lang/RuntimeException")
            .with_class("java/lang/IllegalArgumentException", "java/lang/RuntimeException")
            .with_class("java/lang/NullPointerException", "java/lang/RuntimeException")
            .with_class("java/io/IOException", "java/lang/Exception")
    }
}

impl ClassHierarchyResolver for ClassHierarchy {
    fn resolve(&self, class_name: &str) -> Option<ClassHierarchyInfo> {
        self.classes.get(class_name).cloned()
    }
}

/// The hierarchy view used while verifying one class.
///
/// The verified class is answered from its own model, everything else goes to the
/// resolver. Results are cached for the lifetime of the view.
pub(crate) struct Hierarchy<'a> {
    resolver: &'a dyn ClassHierarchyResolver,
    current: &'a ClassModel,
    cache: RefCell<HashMap<String, ClassHierarchyInfo>>,
}

impl<'a> Hierarchy<'a> {
    pub(crate) fn new(resolver: &'a dyn ClassHierarchyResolver, current: &'a ClassModel) -> Self {
        Self {
            resolver,
            current,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Returns the hierarchy information of `class_name`.
    pub(crate) fn resolve(&self, class_name: &str) -> VerifyResult<ClassHierarchyInfo> {
        if class_name == self.current.this_class {
            return Ok(self.current.hierarchy_info());
        }
        if let Some(info) = self.cache.borrow().get(class_name) {
            return Ok(info.clone());
        }
        let info = self
            .resolver
            .resolve(class_name)
            .ok_or_else(|| VerificationError::UnresolvedClass(class_name.to_string()))?;
        self.cache
            .borrow_mut()
            .insert(class_name.to_string(), info.clone());
        Ok(info)
    }

    /// Returns `true` if `class_name` is an interface.
    pub(crate) fn is_interface(&self, class_name: &str) -> VerifyResult<bool> {
        Ok(self.resolve(class_name)?.is_interface)
    }

    /// Returns `true` if `class_name` is `target` or one of its subclasses.
    pub(crate) fn is_subclass_of(&self, class_name: &str, target: &str) -> VerifyResult<bool> {
        let mut current = class_name.to_string();
        for _ in 0..MAX_HIERARCHY_DEPTH {
            if current == target {
                return Ok(true);
            }
            match self.resolve(&current)?.super_class {
                Some(super_class) => current = super_class,
                None => return Ok(false),
            }
        }
        Err(VerificationError::HierarchyDepthLimitReached(
            class_name.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ClassBuilder;

    #[test]
    fn test_default_hierarchy() {
        let hierarchy = ClassHierarchy::default();
        assert_eq!(
            hierarchy.resolve("java/lang/RuntimeException"),
            Some(ClassHierarchyInfo::class("java/lang/Exception"))
        );
        assert_eq!(
            hierarchy.resolve(JAVA_LANG_CLONEABLE),
            Some(ClassHierarchyInfo::interface())
        );
        assert_eq!(hierarchy.resolve("does/not/Exist"), None);
    }

    #[test]
    fn test_subclass_walk() {
        let resolver = ClassHierarchy::default().with_class("pkg/Base", JAVA_LANG_OBJECT);
        let class = ClassBuilder::new("pkg/Derived").super_class("pkg/Base").build();
        let hierarchy = Hierarchy::new(&resolver, &class);

        assert_eq!(hierarchy.is_subclass_of("pkg/Derived", "pkg/Base"), Ok(true));
        assert_eq!(hierarchy.is_subclass_of("pkg/Derived", JAVA_LANG_OBJECT), Ok(true));
        assert_eq!(hierarchy.is_subclass_of("pkg/Base", "pkg/Derived"), Ok(false));
        assert_eq!(
            hierarchy.is_subclass_of("pkg/Unknown", "pkg/Base"),
            Err(VerificationError::UnresolvedClass("pkg/Unknown".into()))
        );
    }

    #[test]
    fn test_cyclic_hierarchy() {
        let resolver = ClassHierarchy::empty()
            .with_class("pkg/A", "pkg/B")
            .with_class("pkg/B", "pkg/A");
        let class = ClassBuilder::new("pkg/C").build();
        let hierarchy = Hierarchy::new(&resolver, &class);

        assert_eq!(
            hierarchy.is_subclass_of("pkg/A", "pkg/C"),
            Err(VerificationError::HierarchyDepthLimitReached("pkg/A".into()))
        );
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |name: &str| {
            (name == "pkg/Closure").then(|| ClassHierarchyInfo::class(JAVA_LANG_OBJECT))
        };
        let class = ClassBuilder::new("pkg/C").build();
        let hierarchy = Hierarchy::new(&resolver, &class);

        assert_eq!(hierarchy.is_interface("pkg/Closure"), Ok(false));
        assert_eq!(hierarchy.is_interface("pkg/C"), Ok(false));
    }
}
