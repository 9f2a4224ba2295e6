use cudarc::driver::CudaContext;

fn main() {
    let count = CudaContext::device_count().unwrap_or(0);
    if count == 0 {
        eprintln!("No cuda devices found");
        return;
    }

    for ordinal in 0..count as usize {
        let context = CudaContext::new(ordinal).unwrap();
        let (free, total) = cudarc::driver::result::mem_get_info().unwrap();

        println!("device {}: {}", ordinal, context.name().unwrap());
        println!("  memory: {}/{} bytes free", free, total);
    }
}
