pub fn unsigned_rounded_up_div<T>(a: T, b: T) -> T
where
    T: num_traits::Unsigned,
{
    a.sub(T::one()).div(b).add(T::one())
}

#[test]
fn rounding_up() {
    assert_eq!(unsigned_rounded_up_div(5u32, 1), 5);
    assert_eq!(unsigned_rounded_up_div(5u32, 2), 3);
    assert_eq!(unsigned_rounded_up_div(5u32, 3), 2);
    assert_eq!(unsigned_rounded_up_div(512u32, 512), 1);
    assert_eq!(unsigned_rounded_up_div(513u32, 512), 2);
}
