/// 创建一个带有索引的常量数组
///
/// 枚举的每个变体对应数组中的一个元素，变体的序号就是元素的下标。
/// 用于描述 ray tracing pipeline 的 shader stage 和 shader group，
/// 这样 group 可以通过 `Stage::X.index()` 引用 stage。
#[macro_export]
macro_rules! enumed_map {
    ($vis:vis $enum_name:ident<$vtype:ty>: { $($variant:ident: $value:expr),* $(,)? }) => {
        #[repr(usize)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $enum_name {
            $($variant,)*
        }

        impl $enum_name {
            pub const COUNT: usize = $crate::count_indexed_array!($($variant),*);

            const VARIANTS: [Self; $crate::count_indexed_array!($($variant),*)] = [$(Self::$variant,)*];

            fn get_array() -> &'static [$vtype; Self::COUNT] {
                // 使用 OnceLock 实现延迟初始化的静态数组
                static ARRAY: std::sync::OnceLock<[$vtype; $crate::count_indexed_array!($($variant),*)]> =
                    std::sync::OnceLock::new();

                ARRAY.get_or_init(|| [
                    $($value,)*
                ])
            }

            #[allow(dead_code)]
            pub fn value(self) -> &'static $vtype {
                &Self::get_array()[self as usize]
            }

            #[allow(dead_code)]
            pub const fn index(self) -> usize {
                self as usize
            }

            #[allow(dead_code)]
            pub fn iter() -> impl Iterator<Item = Self> {
                Self::VARIANTS.into_iter()
            }

            #[allow(dead_code)]
            pub fn array() -> &'static [$vtype; Self::COUNT] {
                Self::get_array()
            }
        }
    };
}

/// 辅助宏，计算变体数量
#[macro_export]
macro_rules! count_indexed_array {
    () => (0);
    ($head:tt $(, $tail:tt)*) => (1 + $crate::count_indexed_array!($($tail),*));
}

#[cfg(test)]
mod tests {
    enumed_map!(Groups<&'static str>: {
        RayGen: "raygen",
        Miss: "miss",
        Hit: "hit",
    });

    #[test]
    fn test_enumed_map_index_and_value() {
        assert_eq!(Groups::COUNT, 3);
        assert_eq!(Groups::Miss.index(), 1);
        assert_eq!(*Groups::Hit.value(), "hit");
        assert_eq!(Groups::iter().map(|g| *g.value()).collect::<Vec<_>>(), vec!["raygen", "miss", "hit"]);
    }
}
