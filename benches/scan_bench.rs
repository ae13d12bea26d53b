use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fwinspect::codec::find_stream;
use fwinspect::filesystem::classify;
use fwinspect::scanner::{find_kernel_banner, find_toolchain, find_uboot_version, printable_runs};

/// 4 MiB of code-like bytes with a few strings near the end.
fn kernel_like() -> Vec<u8> {
    let mut data: Vec<u8> = (0..4u32 << 20).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
    let tail = data.len() - 4096;
    let banner = b"\x00Linux version 4.19.91 (builder@host) (gcc version 8.4.0) #1 SMP\n\x00";
    data[tail..tail + banner.len()].copy_from_slice(banner);
    data
}

fn bench_classify(c: &mut Criterion) {
    let mut ubi = vec![0xFFu8; 3 * 128 * 1024];
    ubi[..4].copy_from_slice(b"UBI#");
    let squashfs = b"hsqs".repeat(64);

    c.bench_function("classify_squashfs", |b| b.iter(|| classify(black_box(&squashfs))));
    c.bench_function("classify_ubi_lookthrough", |b| b.iter(|| classify(black_box(&ubi))));
}

fn bench_scan(c: &mut Criterion) {
    let data = kernel_like();

    c.bench_function("printable_runs_4mb", |b| b.iter(|| printable_runs(black_box(&data)).count()));
    c.bench_function("kernel_banner_4mb", |b| b.iter(|| find_kernel_banner(black_box(&data))));
    c.bench_function("uboot_version_4mb", |b| b.iter(|| find_uboot_version(black_box(&data))));
    c.bench_function("toolchain_4mb", |b| b.iter(|| find_toolchain(black_box(&data))));
    c.bench_function("find_stream_4mb", |b| b.iter(|| find_stream(black_box(&data), 0)));
}

criterion_group!(benches, bench_classify, bench_scan);
criterion_main!(benches);
