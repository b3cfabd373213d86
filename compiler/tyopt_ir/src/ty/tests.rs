use super::*;

#[test]
fn preinterned_ids_are_stable() {
    assert_eq!(TypeId::VOID.raw(), 0);
    assert_eq!(TypeId::I32.raw(), 4);
    assert_eq!(TypeId::F64.raw(), 7);
    assert!(TypeId::F64.is_preinterned());
    assert!(!TypeId::from_raw(TypeId::PREINTERNED).is_preinterned());
}

#[test]
fn debug_names_scalars() {
    assert_eq!(format!("{:?}", TypeId::I8), "TypeId(i8)");
    assert_eq!(format!("{:?}", TypeId::from_raw(42)), "TypeId(42)");
}

#[test]
fn struct_attr_queries() {
    let s = StructType {
        name: Some("U".into()),
        body: Some(vec![TypeId::I32]),
        direct_base: None,
        attrs: StructAttrs::BYTE_LAYOUT | StructAttrs::PACKED,
    };
    assert!(s.has_byte_layout());
    assert!(s.is_packed());
    assert!(!s.is_raw_memory());
    assert!(!s.is_opaque());
    assert_eq!(s.fields(), &[TypeId::I32]);
}

#[test]
fn opaque_struct_has_no_fields() {
    let s = StructType {
        name: None,
        body: None,
        direct_base: None,
        attrs: StructAttrs::empty(),
    };
    assert!(s.is_opaque());
    assert!(s.fields().is_empty());
}

#[test]
fn tag_names() {
    assert_eq!(TypeKind::Void.tag_name(), "void");
    assert_eq!(
        TypeKind::Array {
            elem: TypeId::I8,
            len: 4
        }
        .tag_name(),
        "array"
    );
}
